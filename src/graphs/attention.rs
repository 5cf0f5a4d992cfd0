use crate::{
    error::{PoolError, Result},
    graph::{hooks, GraphParams, KernelGraph, KernelGraphNode},
    op::{MatMulParam, SelfAttentionParam},
    pool::GraphOperation,
};

/// Decoder self attention over a key/value cache:
/// `o_proj(self_attention(q_proj(x), k, v))`.
///
/// Inputs: `x` (`[tokens, hidden]`), `wq` (`[heads * head_dim, hidden]`),
/// `k` and `v` (`[kv_tokens, kv_heads * head_dim]`), `wo`
/// (`[hidden, heads * head_dim]`). Output: `out` (`[tokens, hidden]`).
///
/// Only the batch layout changes between decoding steps, so pooled graphs
/// are reused across steps and just have the attention node patched.
pub struct Attention;

#[derive(Clone, Debug, PartialEq)]
pub struct AttentionParam {
    pub head_num: i64,
    pub kv_head_num: i64,
    pub head_dim: i64,
    pub token_offset: Vec<i32>,
    pub seq_len: Vec<i32>,
}

impl AttentionParam {
    fn attention(&self) -> SelfAttentionParam {
        let scale = 1.0 / (self.head_dim as f32).sqrt();
        SelfAttentionParam {
            token_offset: self.token_offset.clone(),
            seq_len: self.seq_len.clone(),
            ..SelfAttentionParam::new(self.head_num, self.kv_head_num, scale)
        }
    }
}

impl GraphOperation for Attention {
    type Param = AttentionParam;

    const NAME: &'static str = "attention";

    fn build(param: &AttentionParam) -> Result<KernelGraph> {
        let mut graph = KernelGraph::new(Self::NAME);
        let x = graph.create_input("x");
        let wq = graph.create_input("wq");
        let k = graph.create_input("k");
        let v = graph.create_input("v");
        let wo = graph.create_input("wo");
        let out = graph.create_output("out");
        let q = graph.create_internal("q");
        let context = graph.create_internal("context");

        graph.add_node(
            KernelGraphNode::new("q_proj", MatMulParam::linear())
                .inputs([x, wq])
                .output(q)
                .with_hook(hooks::matmul_extents()),
        );
        graph.add_node(
            KernelGraphNode::new("attn", param.attention())
                .inputs([q, k, v])
                .output(context),
        );
        graph.add_node(
            KernelGraphNode::new("o_proj", MatMulParam::linear())
                .inputs([context, wo])
                .output(out)
                .with_hook(hooks::matmul_extents()),
        );
        Ok(graph)
    }

    fn same_topology(a: &AttentionParam, b: &AttentionParam) -> bool {
        (a.head_num, a.kv_head_num, a.head_dim) == (b.head_num, b.kv_head_num, b.head_dim)
    }

    fn update(param: &AttentionParam, graph: &mut GraphParams<'_>) -> Result<(), PoolError> {
        let attention = graph.get_mut::<SelfAttentionParam>("attn")?;
        attention.token_offset = param.token_offset.clone();
        attention.seq_len = param.seq_len.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{Error, ShapeError},
        graphs::test_util::{context, tensors},
        op::OpParam,
        variant_pack::VariantPack,
    };

    fn step(token_offset: Vec<i32>, seq_len: Vec<i32>) -> AttentionParam {
        AttentionParam {
            head_num: 2,
            kv_head_num: 1,
            head_dim: 4,
            token_offset,
            seq_len,
        }
    }

    fn pack(tokens: i64, kv_tokens: i64) -> VariantPack {
        VariantPack::new(
            tensors(&[&[tokens, 8], &[8, 8], &[kv_tokens, 4], &[kv_tokens, 4], &[8, 8]]),
            tensors(&[&[tokens, 8]]),
        )
    }

    fn snapshot(graph: &KernelGraph) -> Vec<(String, OpParam)> {
        graph
            .nodes()
            .iter()
            .map(|node| (node.name().to_string(), node.base_param().clone()))
            .collect()
    }

    #[test]
    fn test_decode_step_workspace() {
        let context = context();
        let (_, workspace) = context
            .setup::<Attention>(&step(vec![3, 0], vec![1, 2]), &pack(3, 6))
            .unwrap();
        // q and context take 256 bytes each, then 2 heads x 3 tokens x 4 keys
        // of f32 scores
        assert_eq!(workspace, 512 + 256);
    }

    #[test]
    fn test_step_update_only_patches_attention() {
        let context = context();
        let first = {
            let (runner, _) = context
                .setup::<Attention>(&step(vec![3, 0], vec![1, 2]), &pack(3, 6))
                .unwrap();
            snapshot(runner.graph())
        };
        let second = {
            let (runner, _) = context
                .setup::<Attention>(&step(vec![4, 2], vec![1, 1]), &pack(2, 8))
                .unwrap();
            snapshot(runner.graph())
        };

        let stats = context.pool().stats();
        assert_eq!((stats.builds, stats.updates), (1, 1));

        let names = |nodes: &[(String, OpParam)]| -> Vec<String> {
            nodes.iter().map(|(name, _)| name.clone()).collect()
        };
        assert_eq!(names(&first), names(&second));
        for ((name, before), (_, after)) in first.iter().zip(&second) {
            if name == "attn" {
                assert_ne!(before, after);
                let after = after.get::<SelfAttentionParam>().unwrap();
                assert_eq!(after.token_offset, [4, 2]);
                assert_eq!(after.seq_len, [1, 1]);
                assert_eq!(after.qk_scale, 0.5);
            } else {
                assert_eq!(before, after, "{name}");
            }
        }
    }

    #[test]
    fn test_head_change_builds_new_graph() {
        let context = context();
        context
            .setup::<Attention>(&step(vec![0], vec![2]), &pack(2, 2))
            .unwrap();
        let wide = AttentionParam {
            kv_head_num: 2,
            ..step(vec![0], vec![2])
        };
        let pack = VariantPack::new(
            tensors(&[&[2, 8], &[8, 8], &[2, 8], &[2, 8], &[8, 8]]),
            tensors(&[&[2, 8]]),
        );
        context.setup::<Attention>(&wide, &pack).unwrap();
        assert_eq!(context.pool().stats().builds, 2);
    }

    #[test]
    fn test_token_count_mismatch() {
        let context = context();
        let err = context
            .setup::<Attention>(&step(vec![3, 0], vec![1, 2]), &pack(4, 6))
            .map(|_| ())
            .unwrap_err();
        match err {
            Error::Setup {
                node,
                source: ShapeError::Dim { expected, actual, .. },
                ..
            } => {
                assert_eq!(node, "attn");
                assert_eq!((expected, actual), (3, 4));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
