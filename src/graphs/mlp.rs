use crate::{
    error::{PoolError, Result},
    graph::{hooks, GraphParams, KernelGraph, KernelGraphNode},
    op::{ActivationKind, ActivationParam, LayerNormParam, MatMulParam},
    pool::GraphOperation,
    view::ViewFn,
};

/// Pre-norm feed forward block:
/// `down(act(up(layer_norm(x))))`.
///
/// Inputs: `x` of any rank, `gamma`, `beta`, `w_up` (`[inter, hidden]`),
/// `w_down` (`[hidden, inter]`), then `b_up` and `b_down` when `has_bias` is
/// set. The output is `[tokens, hidden]` where `tokens` is the product of the
/// leading dimensions of `x`; binding it with the shape of `x` also works.
/// With [`ActivationKind::Swiglu`] `w_up` is `[2 * inter, hidden]`.
pub struct Mlp;

#[derive(Clone, Debug, PartialEq)]
pub struct MlpParam {
    pub activation: ActivationKind,
    pub has_bias: bool,
    pub epsilon: f32,
}

impl Default for MlpParam {
    fn default() -> Self {
        Self {
            activation: ActivationKind::Gelu,
            has_bias: false,
            epsilon: 1e-5,
        }
    }
}

impl MlpParam {
    fn projection(&self) -> MatMulParam {
        let linear = MatMulParam::linear();
        if self.has_bias {
            linear.with_bias()
        } else {
            linear
        }
    }
}

impl GraphOperation for Mlp {
    type Param = MlpParam;

    const NAME: &'static str = "mlp";

    fn build(param: &MlpParam) -> Result<KernelGraph> {
        let mut graph = KernelGraph::new(Self::NAME);
        let x = graph.create_input("x");
        let gamma = graph.create_input("gamma");
        let beta = graph.create_input("beta");
        let w_up = graph.create_input("w_up");
        let w_down = graph.create_input("w_down");
        let biases = param
            .has_bias
            .then(|| (graph.create_input("b_up"), graph.create_input("b_down")));
        let y = graph.create_output("y");
        let normed = graph.create_internal("normed");
        let up = graph.create_internal("up");
        let act = graph.create_internal("act");

        let norm = LayerNormParam {
            epsilon: param.epsilon,
            ..Default::default()
        };
        graph.add_node(
            KernelGraphNode::new("norm", norm)
                .inputs([x, gamma, beta])
                .output(normed)
                .with_hook(hooks::layer_norm_axis(1)),
        );

        let mut up_node = KernelGraphNode::new("up", param.projection())
            .inputs([normed, w_up])
            .output(up)
            .view(0, ViewFn::flatten_leading())
            .with_hook(hooks::matmul_extents());
        let mut down_node = KernelGraphNode::new("down", param.projection())
            .inputs([act, w_down])
            .output(y)
            .with_hook(hooks::matmul_extents());
        if let Some((b_up, b_down)) = biases {
            up_node = up_node.input(b_up);
            down_node = down_node.input(b_down);
        }

        graph.add_node(up_node);
        graph.add_node(
            KernelGraphNode::new("act", ActivationParam::new(param.activation))
                .input(up)
                .output(act),
        );
        graph.add_node(down_node);
        Ok(graph)
    }

    fn same_topology(a: &MlpParam, b: &MlpParam) -> bool {
        a.has_bias == b.has_bias && a.activation == b.activation
    }

    fn update(param: &MlpParam, graph: &mut GraphParams<'_>) -> Result<(), PoolError> {
        graph.get_mut::<LayerNormParam>("norm")?.epsilon = param.epsilon;
        Ok(())
    }
}
