//! Reusable parameter-rewrite hooks.

use std::sync::Arc;

use crate::{
    error::ShapeError,
    op::{LayerNormParam, MatMulParam, OpParam},
    tensor::TensorFormat,
};

use super::{InferContext, InferHook};

fn hook(
    f: impl Fn(&mut InferContext<'_>, &mut OpParam) -> Result<(), ShapeError>
        + Send
        + Sync
        + 'static,
) -> InferHook {
    Arc::new(f)
}

/// Fills in [`MatMulParam::extents`] from the node's (viewed) operands.
pub fn matmul_extents() -> InferHook {
    hook(|ctx, param| {
        let (a, b) = (ctx.input(0)?.shape.clone(), ctx.input(1)?.shape.clone());
        let matmul = param.expect_mut::<MatMulParam>()?;
        let extents = matmul
            .extents_for(&a, &b)
            .ok_or_else(|| ShapeError::invalid(format!("matmul operands {a} x {b} are not 2d")))?;
        matmul.extents = Some(extents);
        Ok(())
    })
}

/// Normalizes over the trailing `norm_dims` dimensions of the input, whatever
/// its rank turns out to be.
pub fn layer_norm_axis(norm_dims: usize) -> InferHook {
    hook(move |ctx, param| {
        let rank = ctx.input(0)?.shape.rank();
        if norm_dims == 0 || norm_dims > rank {
            return Err(ShapeError::invalid(format!(
                "cannot normalize over {norm_dims} trailing dims of a rank {rank} input"
            )));
        }
        let norm = param.expect_mut::<LayerNormParam>()?;
        norm.begin_norm_axis = (rank - norm_dims) as i64;
        norm.begin_params_axis = (rank - norm_dims) as i64;
        Ok(())
    })
}

/// Reads input `index` in the tiled format, for weights that were laid out
/// ahead of time.
pub fn tiled_input(index: usize) -> InferHook {
    hook(move |ctx, _| ctx.set_input_format(index, TensorFormat::Tiled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::KernelGraph,
        op::{ElewiseKind, ElewiseParam, MatMulExtents},
        tensor::{DataType, TensorDesc},
    };

    fn run(
        hook: &InferHook,
        inputs: &mut [TensorDesc],
        param: &mut OpParam,
    ) -> Result<(), ShapeError> {
        let graph = KernelGraph::new("hooks");
        let mut ctx = InferContext {
            node: "node",
            inputs,
            graph: &graph,
        };
        hook(&mut ctx, param)
    }

    #[test]
    fn test_matmul_extents() {
        let mut inputs = [
            TensorDesc::new(DataType::F32, [6, 8]),
            TensorDesc::new(DataType::F32, [16, 8]),
        ];
        let mut param: OpParam = MatMulParam::linear().into();
        run(&matmul_extents(), &mut inputs, &mut param).unwrap();
        assert_eq!(
            param.get::<MatMulParam>().unwrap().extents,
            Some(MatMulExtents { m: 6, n: 16, k: 8 })
        );

        let mut wrong: OpParam = ElewiseParam::new(ElewiseKind::Add).into();
        let err = run(&matmul_extents(), &mut inputs, &mut wrong).unwrap_err();
        assert!(matches!(err, ShapeError::Param { expected: "matmul", .. }));
    }

    #[test]
    fn test_layer_norm_axis_follows_rank() {
        let mut inputs = [TensorDesc::new(DataType::F32, [2, 3, 8])];
        let mut param: OpParam = LayerNormParam::default().into();
        run(&layer_norm_axis(1), &mut inputs, &mut param).unwrap();
        let norm = param.get::<LayerNormParam>().unwrap();
        assert_eq!((norm.begin_norm_axis, norm.begin_params_axis), (2, 2));
        assert!(run(&layer_norm_axis(4), &mut inputs, &mut param).is_err());
    }

    #[test]
    fn test_tiled_input() {
        let mut inputs = [
            TensorDesc::new(DataType::F32, [6, 8]),
            TensorDesc::new(DataType::F32, [16, 8]),
        ];
        let mut param: OpParam = MatMulParam::linear().into();
        run(&tiled_input(1), &mut inputs, &mut param).unwrap();
        assert_eq!(inputs[1].format, TensorFormat::Tiled);
        assert!(run(&tiled_input(2), &mut inputs, &mut param).is_err());
    }
}
