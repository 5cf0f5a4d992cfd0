//! Operator graphs over device memory.
//!
//! A [`KernelGraph`] wires primitive operators ([`op`]) into a fused
//! operation. A [`Runner`] resolves the graph's shapes for a concrete
//! [`VariantPack`], plans one workspace for its intermediates and enqueues
//! every node on a [`KernelRegistry`]. [`RunnerPool`] keeps built runners
//! around so repeated calls with the same topology skip graph construction.

pub use config::EngineConfig;
pub use context::Context;
pub use error::{ConfigError, DeviceError, Error, KernelError, PoolError, Result, ShapeError};
pub use graph::{GraphParams, KernelGraph, KernelGraphNode, NodeId, TensorId};
pub use pool::{GraphOperation, PoolStats, RunnerGuard, RunnerPool, RunnerPoolBuilder};
pub use registry::{DryRunRegistry, KernelLaunch, KernelRegistry, LaunchRecord, TensorBinding};
pub use runner::{Runner, RunnerState};
pub use tensor::{
    DataType, DevicePtr, DeviceSpan, Memory, Shape, Tensor, TensorDesc, TensorFormat, MAX_RANK,
};
pub use variant_pack::VariantPack;
pub use view::ViewFn;
pub use workspace::{lifetimes, TensorLifetime, WorkspacePlan, WorkspaceStrategy};

mod config;
mod context;
mod error;
pub mod gpu;
pub mod graph;
pub mod graphs;
pub mod op;
mod pool;
mod registry;
mod runner;
mod tensor;
mod variant_pack;
mod view;
mod workspace;
