use std::sync::Arc;

use log::trace;

use crate::{
    error::Result,
    pool::{GraphOperation, RunnerGuard, RunnerPool},
    registry::KernelRegistry,
    variant_pack::VariantPack,
};

/// A kernel registry paired with a shared runner pool.
///
/// This is the usual entry point: one call per operation, the pool takes
/// care of building or reusing the graph.
pub struct Context<R> {
    registry: R,
    pool: Arc<RunnerPool>,
}

impl<R: KernelRegistry> Context<R> {
    pub fn new(registry: R, pool: Arc<RunnerPool>) -> Self {
        Self { registry, pool }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn pool(&self) -> &RunnerPool {
        &self.pool
    }

    /// Checks out the runner for `param` and sets it up for `pack`.
    ///
    /// Returns the runner with the workspace size it needs. The caller
    /// provides that much workspace in the pack handed to
    /// [`Context::execute`].
    pub fn setup<T: GraphOperation>(
        &self,
        param: &T::Param,
        pack: &VariantPack,
    ) -> Result<(RunnerGuard<'_>, u64)> {
        let mut runner = self.pool.malloc_runner::<T>(param)?;
        let workspace = runner.setup(pack)?;
        trace!("`{}` needs {workspace} workspace bytes", T::NAME);
        Ok((runner, workspace))
    }

    pub fn execute(
        &self,
        runner: &mut RunnerGuard<'_>,
        stream: &mut R::Stream,
        pack: &VariantPack,
    ) -> Result<()> {
        runner.execute(&self.registry, stream, pack)
    }

    /// Set up and execute in one go. `pack` must already carry a large
    /// enough workspace.
    pub fn run<T: GraphOperation>(
        &self,
        param: &T::Param,
        pack: &VariantPack,
        stream: &mut R::Stream,
    ) -> Result<()> {
        let (mut runner, _) = self.setup::<T>(param, pack)?;
        self.execute(&mut runner, stream, pack)
    }
}
