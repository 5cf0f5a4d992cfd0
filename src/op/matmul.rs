use enumset::EnumSet;

use crate::{
    error::ShapeError,
    tensor::{Shape, TensorDesc, TensorFormat},
};

use super::{expect_dtype, expect_rank, Operator};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MatMulExtents {
    pub m: i64,
    pub n: i64,
    pub k: i64,
}

/// Two dimensional `a @ b (+ bias)`.
///
/// `a` is `[m, k]` (`[k, m]` transposed), `b` is `[k, n]` (`[n, k]`
/// transposed). The weight operand may be tiled. `extents` is filled in by a
/// setup hook so the kernel does not need to re-derive them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatMulParam {
    pub transpose_a: bool,
    pub transpose_b: bool,
    pub has_bias: bool,
    pub extents: Option<MatMulExtents>,
}

impl MatMulParam {
    pub fn linear() -> Self {
        Self {
            transpose_b: true,
            ..Default::default()
        }
    }

    pub fn with_bias(mut self) -> Self {
        self.has_bias = true;
        self
    }

    pub fn extents_for(&self, a: &Shape, b: &Shape) -> Option<MatMulExtents> {
        if a.rank() != 2 || b.rank() != 2 {
            return None;
        }
        let (m, k) = if self.transpose_a {
            (a[1], a[0])
        } else {
            (a[0], a[1])
        };
        let n = if self.transpose_b { b[0] } else { b[1] };
        Some(MatMulExtents { m, n, k })
    }
}

impl Operator for MatMulParam {
    const NAME: &'static str = "matmul";

    fn input_count(&self) -> usize {
        if self.has_bias {
            3
        } else {
            2
        }
    }

    fn accepted_formats(&self, input: usize) -> EnumSet<TensorFormat> {
        if input == 1 {
            EnumSet::all()
        } else {
            EnumSet::only(TensorFormat::RowMajor)
        }
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        expect_rank(inputs, 0, 2)?;
        expect_rank(inputs, 1, 2)?;
        expect_dtype(inputs, 1, inputs[0].dtype)?;
        let (a, b) = (&inputs[0].shape, &inputs[1].shape);
        let (k_axis, k_b) = if self.transpose_b { (1, b[1]) } else { (0, b[0]) };
        let Some(extents) = self.extents_for(a, b) else {
            return Err(ShapeError::invalid("matmul operands must be rank 2"));
        };
        if k_b != extents.k {
            return Err(ShapeError::Dim {
                index: 1,
                axis: k_axis,
                expected: extents.k,
                actual: k_b,
            });
        }
        if let Some(declared) = self.extents {
            if declared != extents {
                return Err(ShapeError::invalid(format!(
                    "declared extents {declared:?} disagree with operands {a} x {b}"
                )));
            }
        }
        if self.has_bias {
            let bias = &inputs[2].shape;
            if bias.dims() != [extents.n] {
                return Err(ShapeError::invalid(format!(
                    "input 2: expected bias shape [{}], got {bias}",
                    extents.n
                )));
            }
        }
        Ok(vec![TensorDesc::new(
            inputs[0].dtype,
            [extents.m, extents.n],
        )])
    }
}
