use crate::{
    error::ShapeError,
    tensor::{DataType, TensorDesc},
};

use super::{expect_dim, expect_dtype, expect_float, expect_rank, normalize_axis, Operator};

#[derive(Clone, Debug, PartialEq)]
pub struct SoftmaxParam {
    pub axis: i64,
}

impl Default for SoftmaxParam {
    fn default() -> Self {
        Self { axis: -1 }
    }
}

impl Operator for SoftmaxParam {
    const NAME: &'static str = "softmax";

    fn input_count(&self) -> usize {
        1
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        expect_float(inputs, 0)?;
        normalize_axis(&inputs[0].shape, self.axis)?;
        Ok(vec![inputs[0].clone()])
    }
}

/// Rotary position embedding applied to `q` and `k` in place of a copy.
///
/// Inputs are `q [tokens, hq * head_dim]`, `k [tokens, hk * head_dim]`,
/// `cos` and `sin` `[tokens, head_dim]`. `rotary_coeff` is the number of
/// interleaved rotation groups per head.
#[derive(Clone, Debug, PartialEq)]
pub struct RopeParam {
    pub rotary_coeff: i64,
}

impl Default for RopeParam {
    fn default() -> Self {
        Self { rotary_coeff: 2 }
    }
}

impl Operator for RopeParam {
    const NAME: &'static str = "rope";

    fn input_count(&self) -> usize {
        4
    }

    fn output_count(&self) -> usize {
        2
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        for index in 0..4 {
            expect_rank(inputs, index, 2)?;
        }
        expect_float(inputs, 0)?;
        for index in 1..4 {
            expect_dtype(inputs, index, inputs[0].dtype)?;
        }
        let tokens = inputs[0].shape[0];
        let head_dim = inputs[2].shape[1];
        if head_dim <= 0 || self.rotary_coeff <= 0 || head_dim % self.rotary_coeff != 0 {
            return Err(ShapeError::invalid(format!(
                "head dim {head_dim} is not divisible by rotary coefficient {}",
                self.rotary_coeff
            )));
        }
        for index in 1..4 {
            expect_dim(inputs, index, 0, tokens)?;
        }
        expect_dim(inputs, 3, 1, head_dim)?;
        for index in 0..2 {
            let hidden = inputs[index].shape[1];
            if hidden % head_dim != 0 {
                return Err(ShapeError::invalid(format!(
                    "input {index}: hidden size {hidden} is not a multiple of head dim {head_dim}"
                )));
            }
        }
        Ok(vec![inputs[0].clone(), inputs[1].clone()])
    }
}

/// Causal multi-head attention over a packed batch with a key/value cache.
///
/// `q` is `[tokens, head_num * head_dim]` where `tokens = sum(seq_len)`.
/// `k` and `v` are `[kv_tokens, kv_head_num * head_dim]`: batch entry `b`
/// owns `token_offset[b] + seq_len[b]` consecutive rows, the cached prefix
/// followed by the new tokens. Query row `i` of entry `b` attends to key rows
/// `0..=token_offset[b] + i` of the same entry.
///
/// `token_offset` and `seq_len` change on every decoding step and are patched
/// in by a dynamic update without rebuilding the graph.
#[derive(Clone, Debug, PartialEq)]
pub struct SelfAttentionParam {
    pub head_num: i64,
    pub kv_head_num: i64,
    pub qk_scale: f32,
    pub token_offset: Vec<i32>,
    pub seq_len: Vec<i32>,
}

impl SelfAttentionParam {
    pub fn new(head_num: i64, kv_head_num: i64, qk_scale: f32) -> Self {
        Self {
            head_num,
            kv_head_num,
            qk_scale,
            token_offset: Vec::new(),
            seq_len: Vec::new(),
        }
    }

    pub fn batch(&self) -> usize {
        self.seq_len.len()
    }

    /// Total query rows described by `seq_len`.
    pub fn tokens(&self) -> i64 {
        self.seq_len.iter().map(|len| *len as i64).sum()
    }

    /// Total key/value rows described by `token_offset` and `seq_len`.
    pub fn kv_tokens(&self) -> i64 {
        self.token_offset
            .iter()
            .zip(&self.seq_len)
            .map(|(offset, len)| *offset as i64 + *len as i64)
            .sum()
    }

    pub fn max_kv_len(&self) -> i64 {
        self.token_offset
            .iter()
            .zip(&self.seq_len)
            .map(|(offset, len)| *offset as i64 + *len as i64)
            .max()
            .unwrap_or(0)
    }

    fn check_batch(&self) -> Result<(), ShapeError> {
        if self.head_num <= 0 || self.kv_head_num <= 0 || self.head_num % self.kv_head_num != 0 {
            return Err(ShapeError::invalid(format!(
                "{} query heads cannot be grouped over {} key/value heads",
                self.head_num, self.kv_head_num
            )));
        }
        if self.token_offset.len() != self.seq_len.len() {
            return Err(ShapeError::invalid(format!(
                "{} token offsets for {} sequence lengths",
                self.token_offset.len(),
                self.seq_len.len()
            )));
        }
        if self.seq_len.iter().chain(&self.token_offset).any(|v| *v < 0) {
            return Err(ShapeError::invalid(
                "token offsets and sequence lengths must be non-negative",
            ));
        }
        Ok(())
    }
}

impl Operator for SelfAttentionParam {
    const NAME: &'static str = "self_attention";

    fn input_count(&self) -> usize {
        3
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        self.check_batch()?;
        for index in 0..3 {
            expect_rank(inputs, index, 2)?;
        }
        expect_float(inputs, 0)?;
        expect_dtype(inputs, 1, inputs[0].dtype)?;
        expect_dtype(inputs, 2, inputs[0].dtype)?;

        let (tokens, hidden) = (inputs[0].shape[0], inputs[0].shape[1]);
        if hidden % self.head_num != 0 {
            return Err(ShapeError::invalid(format!(
                "query hidden size {hidden} is not a multiple of {} heads",
                self.head_num
            )));
        }
        let head_dim = hidden / self.head_num;
        if tokens >= 0 && tokens != self.tokens() {
            return Err(ShapeError::Dim {
                index: 0,
                axis: 0,
                expected: self.tokens(),
                actual: tokens,
            });
        }
        for index in 1..3 {
            expect_dim(inputs, index, 0, self.kv_tokens())?;
            expect_dim(inputs, index, 1, self.kv_head_num * head_dim)?;
        }
        Ok(vec![inputs[0].clone()])
    }

    /// One f32 score row per query head and token, as wide as the longest
    /// key range in the batch.
    fn scratch_bytes(&self, inputs: &[TensorDesc]) -> u64 {
        let tokens = inputs.first().map_or(0, |q| q.shape.first().copied().unwrap_or(0));
        let elements = self
            .head_num
            .saturating_mul(tokens)
            .saturating_mul(self.max_kv_len());
        (elements.max(0) as u64).saturating_mul(DataType::F32.size_in_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;

    fn f32(shape: impl Into<Shape>) -> TensorDesc {
        TensorDesc::new(DataType::F32, shape)
    }

    fn decode_step() -> SelfAttentionParam {
        SelfAttentionParam {
            token_offset: vec![3, 0],
            seq_len: vec![1, 2],
            ..SelfAttentionParam::new(4, 2, 0.5)
        }
    }

    #[test]
    fn test_self_attention_shapes_and_scratch() {
        let param = decode_step();
        assert_eq!(param.tokens(), 3);
        assert_eq!(param.kv_tokens(), 6);
        let inputs = [f32([3, 32]), f32([6, 16]), f32([6, 16])];
        let out = param.infer_shape(&inputs).unwrap();
        assert_eq!(out[0].shape, Shape::from([3, 32]));
        // 4 heads * 3 tokens * 4 keys * 4 bytes
        assert_eq!(param.scratch_bytes(&inputs), 192);
    }

    #[test]
    fn test_self_attention_token_mismatch() {
        let param = decode_step();
        let err = param
            .infer_shape(&[f32([5, 32]), f32([6, 16]), f32([6, 16])])
            .unwrap_err();
        assert_eq!(
            err,
            ShapeError::Dim {
                index: 0,
                axis: 0,
                expected: 3,
                actual: 5
            }
        );
        let uneven = SelfAttentionParam {
            token_offset: vec![0],
            ..decode_step()
        };
        assert!(uneven
            .infer_shape(&[f32([3, 32]), f32([6, 16]), f32([6, 16])])
            .is_err());
    }

    #[test]
    fn test_self_attention_offsets_near_i32_max() {
        let param = SelfAttentionParam {
            token_offset: vec![i32::MAX, i32::MAX],
            seq_len: vec![1, 0],
            ..SelfAttentionParam::new(4, 2, 0.5)
        };
        assert_eq!(param.kv_tokens(), 2 * i32::MAX as i64 + 1);
        assert_eq!(param.max_kv_len(), i32::MAX as i64 + 1);
        let err = param
            .infer_shape(&[f32([1, 32]), f32([6, 16]), f32([6, 16])])
            .unwrap_err();
        assert_eq!(
            err,
            ShapeError::Dim {
                index: 1,
                axis: 0,
                expected: 2 * i32::MAX as i64 + 1,
                actual: 6
            }
        );
    }

    #[test]
    fn test_rope_shapes() {
        let param = RopeParam::default();
        let out = param
            .infer_shape(&[f32([5, 32]), f32([5, 16]), f32([5, 8]), f32([5, 8])])
            .unwrap();
        assert_eq!(out[0].shape, Shape::from([5, 32]));
        assert_eq!(out[1].shape, Shape::from([5, 16]));
        assert!(RopeParam { rotary_coeff: 3 }
            .infer_shape(&[f32([5, 32]), f32([5, 16]), f32([5, 8]), f32([5, 8])])
            .is_err());
    }

    #[test]
    fn test_softmax_axis() {
        assert!(SoftmaxParam { axis: 2 }.infer_shape(&[f32([2, 3])]).is_err());
        let out = SoftmaxParam::default().infer_shape(&[f32([2, 3])]).unwrap();
        assert_eq!(out[0], f32([2, 3]));
    }
}
