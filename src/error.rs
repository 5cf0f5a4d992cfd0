use crate::tensor::{DataType, DevicePtr, Shape, TensorFormat};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by graph construction, setup, execute and the runner pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("graph `{graph}` is malformed: {reason}")]
    InvalidGraph { graph: String, reason: String },

    #[error("node `{node}` ({op}): {source}")]
    Setup {
        node: String,
        op: &'static str,
        #[source]
        source: ShapeError,
    },

    #[error("node `{node}` ({op}): view on input {input} changed the element count from {from} to {to}")]
    View {
        node: String,
        op: &'static str,
        input: usize,
        from: Shape,
        to: Shape,
    },

    #[error("node `{node}` ({op}): infer hook failed: {source}")]
    Hook {
        node: String,
        op: &'static str,
        #[source]
        source: ShapeError,
    },

    #[error("graph `{graph}` expects {expected} {kind} tensors, got {actual}")]
    BindingCount {
        graph: String,
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{kind} tensor {index} of graph `{graph}`: {reason}")]
    Binding {
        graph: String,
        kind: &'static str,
        index: usize,
        reason: String,
    },

    #[error("node `{node}` ({op}): output {index} inferred as {inferred} but the bound tensor is {bound}")]
    OutputMismatch {
        node: String,
        op: &'static str,
        index: usize,
        inferred: String,
        bound: String,
    },

    #[error("internal tensor `{name}` has unresolved shape {shape}")]
    Unresolved { name: String, shape: Shape },

    #[error("workspace of {provided} bytes is smaller than the required {required} bytes")]
    Workspace { required: u64, provided: u64 },

    #[error("runner for `{graph}` is {state:?}, expected {expected}")]
    State {
        graph: String,
        state: crate::runner::RunnerState,
        expected: &'static str,
    },

    #[error("node `{node}` ({op}) failed to launch: {source}")]
    Dispatch {
        node: String,
        op: &'static str,
        #[source]
        source: KernelError,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure of an operator's shape inference or of a parameter-rewrite hook.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("expected {expected} inputs, got {actual}")]
    InputCount { expected: usize, actual: usize },

    #[error("input {index}: expected rank {expected}, got shape {actual}")]
    Rank {
        index: usize,
        expected: String,
        actual: Shape,
    },

    #[error("input {index}: expected dtype {expected}, got {actual}")]
    DataType {
        index: usize,
        expected: DataType,
        actual: DataType,
    },

    #[error("input {index}: format {actual} is not accepted by this operator")]
    Format { index: usize, actual: TensorFormat },

    #[error("input {index}: dimension {axis} is {actual}, expected {expected}")]
    Dim {
        index: usize,
        axis: usize,
        expected: i64,
        actual: i64,
    },

    #[error("shapes {lhs} and {rhs} cannot be broadcast together")]
    Broadcast { lhs: Shape, rhs: Shape },

    #[error("axis {axis} is out of range for rank {rank}")]
    Axis { axis: i64, rank: usize },

    #[error("expected operator parameter `{expected}`, found `{found}`")]
    Param {
        expected: &'static str,
        found: &'static str,
    },

    #[error("{0}")]
    Invalid(String),
}

impl ShapeError {
    pub fn invalid(reason: impl ToString) -> Self {
        Self::Invalid(reason.to_string())
    }
}

/// Failure reported by a kernel registry for one launch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("no kernel for operator `{op}`: {reason}")]
    Unsupported { op: String, reason: String },

    #[error("kernel rejected the launch: {0}")]
    Rejected(String),

    #[error("device error: {0}")]
    Device(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolError {
    #[error("graph operation `{0}` was not registered with the runner pool")]
    Unregistered(&'static str),

    #[error("runner for `{0}` with these parameters is already checked out")]
    Busy(&'static str),

    #[error("all {capacity} pooled runners for `{name}` are checked out")]
    Exhausted { name: &'static str, capacity: usize },

    #[error("dynamic update of `{name}` failed on node `{node}`: {reason}")]
    Update {
        name: &'static str,
        node: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("workspace alignment must be a non-zero power of two, got {0}")]
    Alignment(u64),

    #[error("pool capacity must be at least 1")]
    PoolCapacity,

    #[error("environment variable {var} has invalid value `{value}`")]
    Env { var: &'static str, value: String },
}

/// Failures of the wgpu backend outside of a single kernel launch.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no compatible gpu adapter found")]
    NoAdapter,

    #[error(transparent)]
    RequestDevice(#[from] wgpu::RequestDeviceError),

    #[error("address {0} is not inside any live allocation")]
    UnknownAddress(DevicePtr),

    #[error("{len} bytes at {ptr} run past the end of their allocation")]
    OutOfBounds { ptr: DevicePtr, len: u64 },

    #[error("{ptr} sits {offset} bytes into its buffer, which is not a multiple of {alignment}")]
    Misaligned {
        ptr: DevicePtr,
        offset: u64,
        alignment: u64,
    },

    #[error("{len} bytes written at {ptr} is not a multiple of {alignment}")]
    UnalignedLength { ptr: DevicePtr, len: u64, alignment: u64 },

    #[error("buffer download failed: {0}")]
    Download(#[from] wgpu::BufferAsyncError),

    #[error("buffer download was dropped before the device answered")]
    Canceled,
}

impl From<DeviceError> for KernelError {
    fn from(err: DeviceError) -> Self {
        KernelError::Device(err.to_string())
    }
}
