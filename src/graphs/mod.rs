//! Ready made graph operations built on the engine.

mod add_norm;
mod attention;
mod mlp;

pub use add_norm::{AddNorm, AddNormParam};
pub use attention::{Attention, AttentionParam};
pub use mlp::{Mlp, MlpParam};

use crate::pool::RunnerPoolBuilder;

/// Registers every graph operation of this module.
pub fn register(builder: RunnerPoolBuilder) -> RunnerPoolBuilder {
    builder
        .register::<AddNorm>()
        .register::<Mlp>()
        .register::<Attention>()
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Arc;

    use crate::{
        context::Context,
        pool::RunnerPool,
        registry::DryRunRegistry,
        tensor::{DataType, DevicePtr, Shape, Tensor, TensorDesc},
    };

    pub(crate) fn context() -> Context<DryRunRegistry> {
        let pool = super::register(RunnerPool::builder()).build().unwrap();
        Context::new(DryRunRegistry::new(), Arc::new(pool))
    }

    /// f32 tensors at made up, non-overlapping addresses.
    pub(crate) fn tensors(shapes: &[&[i64]]) -> Vec<Tensor> {
        shapes
            .iter()
            .enumerate()
            .map(|(i, shape)| {
                Tensor::external(
                    TensorDesc::new(DataType::F32, Shape::from(*shape)),
                    DevicePtr(0x100_0000 * (i as u64 + 1)),
                )
            })
            .collect()
    }
}
