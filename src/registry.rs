//! The boundary to whatever actually runs an operator.

use std::sync::Arc;

use crate::{
    error::KernelError,
    op::OpParam,
    tensor::{DevicePtr, DeviceSpan, TensorDesc},
};

/// A tensor as a kernel sees it: descriptor plus raw device range.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorBinding {
    pub desc: TensorDesc,
    pub ptr: DevicePtr,
    pub byte_size: u64,
}

impl TensorBinding {
    pub fn span(&self) -> DeviceSpan {
        DeviceSpan::new(self.ptr, self.byte_size)
    }
}

/// Everything a registry needs to enqueue one node.
#[derive(Clone, Debug)]
pub struct KernelLaunch<'a> {
    pub node: &'a str,
    pub op: &'static str,
    pub param: &'a OpParam,
    pub inputs: Vec<TensorBinding>,
    pub outputs: Vec<TensorBinding>,
    /// The node's slice of the shared scratch region, if it asked for any.
    pub scratch: Option<DeviceSpan>,
}

/// Enqueues operator kernels on a stream.
///
/// A launch only records work; it may return before the kernel has run.
/// Launches on one stream execute in the order they were made.
pub trait KernelRegistry {
    type Stream;

    fn launch(&self, launch: &KernelLaunch<'_>, stream: &mut Self::Stream)
        -> Result<(), KernelError>;
}

impl<R: KernelRegistry + ?Sized> KernelRegistry for Arc<R> {
    type Stream = R::Stream;

    fn launch(
        &self,
        launch: &KernelLaunch<'_>,
        stream: &mut Self::Stream,
    ) -> Result<(), KernelError> {
        (**self).launch(launch, stream)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LaunchRecord {
    pub node: String,
    pub op: &'static str,
    pub param: OpParam,
    pub inputs: Vec<TensorBinding>,
    pub outputs: Vec<TensorBinding>,
    pub scratch: Option<DeviceSpan>,
}

/// A registry that runs nothing and records every launch into its stream.
#[derive(Clone, Debug, Default)]
pub struct DryRunRegistry {
    rejected: Vec<&'static str>,
}

impl DryRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every launch of operator `op`.
    pub fn with_rejected(mut self, op: &'static str) -> Self {
        self.rejected.push(op);
        self
    }
}

impl KernelRegistry for DryRunRegistry {
    type Stream = Vec<LaunchRecord>;

    fn launch(
        &self,
        launch: &KernelLaunch<'_>,
        stream: &mut Self::Stream,
    ) -> Result<(), KernelError> {
        if self.rejected.contains(&launch.op) {
            return Err(KernelError::Rejected(format!(
                "{} is disabled in this registry",
                launch.op
            )));
        }
        stream.push(LaunchRecord {
            node: launch.node.to_string(),
            op: launch.op,
            param: launch.param.clone(),
            inputs: launch.inputs.clone(),
            outputs: launch.outputs.clone(),
            scratch: launch.scratch,
        });
        Ok(())
    }
}
