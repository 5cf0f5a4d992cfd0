use crate::{
    error::{PoolError, Result},
    graph::{hooks, GraphParams, KernelGraph, KernelGraphNode},
    op::{ElewiseKind, ElewiseParam, LayerNormParam},
    pool::GraphOperation,
};

/// `layer_norm(x + residual)`, keeping the per-row statistics.
///
/// Inputs: `x`, `residual`, `gamma`, `beta`. Output: `out`.
pub struct AddNorm;

#[derive(Clone, Debug, PartialEq)]
pub struct AddNormParam {
    pub epsilon: f32,
    /// Trailing dimensions normalized over.
    pub norm_dims: usize,
}

impl Default for AddNormParam {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            norm_dims: 1,
        }
    }
}

impl GraphOperation for AddNorm {
    type Param = AddNormParam;

    const NAME: &'static str = "add_norm";

    fn build(param: &AddNormParam) -> Result<KernelGraph> {
        let mut graph = KernelGraph::new(Self::NAME);
        let x = graph.create_input("x");
        let residual = graph.create_input("residual");
        let gamma = graph.create_input("gamma");
        let beta = graph.create_input("beta");
        let out = graph.create_output("out");
        let sum = graph.create_internal("sum");
        let mean = graph.create_internal("mean");
        let rstd = graph.create_internal("rstd");

        graph.add_node(
            KernelGraphNode::new("add", ElewiseParam::new(ElewiseKind::Add))
                .inputs([x, residual])
                .output(sum),
        );
        let norm = LayerNormParam {
            epsilon: param.epsilon,
            with_stats: true,
            ..Default::default()
        };
        graph.add_node(
            KernelGraphNode::new("norm", norm)
                .inputs([sum, gamma, beta])
                .outputs([out, mean, rstd])
                .with_hook(hooks::layer_norm_axis(param.norm_dims)),
        );
        Ok(graph)
    }

    fn same_topology(a: &AddNormParam, b: &AddNormParam) -> bool {
        a.norm_dims == b.norm_dims
    }

    fn update(param: &AddNormParam, graph: &mut GraphParams<'_>) -> Result<(), PoolError> {
        graph.get_mut::<LayerNormParam>("norm")?.epsilon = param.epsilon;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{Error, ShapeError},
        graph::TensorId,
        graphs::test_util::{context, tensors},
        tensor::{DeviceSpan, DevicePtr, Shape},
        variant_pack::VariantPack,
    };

    #[test]
    fn test_add_norm_shapes() {
        let context = context();
        let pack = VariantPack::new(
            tensors(&[&[2, 4], &[2, 4], &[4], &[4]]),
            tensors(&[&[2, 4]]),
        );
        let (runner, workspace) = context
            .setup::<AddNorm>(&AddNormParam::default(), &pack)
            .unwrap();
        let graph = runner.graph();
        assert_eq!(
            graph.tensor(TensorId::Output(0)).unwrap().desc.shape,
            Shape::from([2, 4])
        );
        for name in ["mean", "rstd"] {
            let slot = graph.internals().iter().find(|s| s.name == name).unwrap();
            let tensor = slot.tensor.as_ref().unwrap();
            assert_eq!(tensor.desc.shape, Shape::from([2, 1]), "{name}");
        }
        // sum, mean and rstd each get their own aligned range
        assert_eq!(workspace, 3 * 256);
    }

    #[test]
    fn test_negative_leading_dim_fails_setup() {
        let context = context();
        let pack = VariantPack::new(
            tensors(&[&[-1, 4], &[-1, 4], &[4], &[4]]),
            tensors(&[&[-1, 4]]),
        );
        let err = context
            .setup::<AddNorm>(&AddNormParam::default(), &pack)
            .map(|_| ())
            .unwrap_err();
        match &err {
            Error::Setup { node, op, source } => {
                assert_eq!(node, "norm");
                assert_eq!(*op, "layer_norm");
                assert!(matches!(source, ShapeError::Invalid(_)));
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(
            err.to_string(),
            "node `norm` (layer_norm): leading dimension product -1 of input [-1, 4] is negative"
        );
    }

    #[test]
    fn test_epsilon_update_reuses_graph() {
        let context = context();
        let pack = VariantPack::new(
            tensors(&[&[3, 8], &[3, 8], &[8], &[8]]),
            tensors(&[&[3, 8]]),
        );
        let mut stream = Vec::new();
        for epsilon in [1e-5, 1e-6] {
            let param = AddNormParam {
                epsilon,
                norm_dims: 1,
            };
            let (mut runner, size) = context.setup::<AddNorm>(&param, &pack).unwrap();
            let pack = pack
                .clone()
                .with_workspace(DeviceSpan::new(DevicePtr(0xf000_0000), size));
            context.execute(&mut runner, &mut stream, &pack).unwrap();
        }
        assert_eq!(context.pool().stats().builds, 1);
        let epsilons: Vec<f32> = stream
            .iter()
            .filter_map(|record| record.param.get::<LayerNormParam>())
            .map(|norm| norm.epsilon)
            .collect();
        assert_eq!(epsilons, [1e-5, 1e-6]);
    }
}
