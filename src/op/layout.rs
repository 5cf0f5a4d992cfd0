use enumset::EnumSet;

use crate::{
    error::ShapeError,
    tensor::{DataType, Shape, TensorDesc, TensorFormat},
};

use super::{expect_dtype, normalize_axis, Operator};

/// Reinterprets the input with explicit sizes, strides and element offset.
///
/// The stride and offset usually depend on the batch and are injected by a
/// setup hook.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AsStridedParam {
    pub size: Vec<i64>,
    pub stride: Vec<i64>,
    pub offset: i64,
}

impl Operator for AsStridedParam {
    const NAME: &'static str = "as_strided";

    fn input_count(&self) -> usize {
        1
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        if self.size.len() != self.stride.len() {
            return Err(ShapeError::invalid(format!(
                "as_strided has {} sizes but {} strides",
                self.size.len(),
                self.stride.len()
            )));
        }
        if self.offset < 0 || self.size.iter().chain(&self.stride).any(|v| *v < 0) {
            return Err(ShapeError::invalid(
                "as_strided sizes, strides and offset must be non-negative",
            ));
        }
        let input = &inputs[0];
        if input.shape.is_resolved() && self.size.iter().all(|s| *s > 0) {
            let last = self
                .size
                .iter()
                .zip(&self.stride)
                .try_fold(self.offset, |acc, (size, stride)| {
                    (size - 1).checked_mul(*stride)?.checked_add(acc)
                });
            let available = input.shape.element_count();
            if last.map_or(true, |last| last >= available) {
                let last = last.map_or_else(|| "past i64::MAX".to_string(), |l| l.to_string());
                return Err(ShapeError::invalid(format!(
                    "as_strided reaches element {last} of an input with {available} elements"
                )));
            }
        }
        Ok(vec![input.with_shape(self.size.clone())])
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransposeParam {
    pub perm: Vec<usize>,
}

impl Operator for TransposeParam {
    const NAME: &'static str = "transpose";

    fn input_count(&self) -> usize {
        1
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        let input = &inputs[0];
        let rank = input.shape.rank();
        let mut seen = vec![false; rank];
        for &axis in &self.perm {
            match seen.get_mut(axis) {
                Some(seen @ false) => *seen = true,
                _ => {
                    return Err(ShapeError::invalid(format!(
                        "{:?} is not a permutation of {rank} axes",
                        self.perm
                    )))
                }
            }
        }
        if self.perm.len() != rank {
            return Err(ShapeError::Rank {
                index: 0,
                expected: self.perm.len().to_string(),
                actual: input.shape.clone(),
            });
        }
        let shape: Shape = self.perm.iter().map(|axis| input.shape[*axis]).collect();
        Ok(vec![input.with_shape(shape)])
    }
}

/// Explicit relayout between memory formats.
#[derive(Clone, Debug, PartialEq)]
pub struct TransDataParam {
    pub target: TensorFormat,
}

impl Operator for TransDataParam {
    const NAME: &'static str = "trans_data";

    fn input_count(&self) -> usize {
        1
    }

    fn accepted_formats(&self, _input: usize) -> EnumSet<TensorFormat> {
        EnumSet::all()
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        let input = &inputs[0];
        if self.target == TensorFormat::Tiled && input.shape.rank() < 2 {
            return Err(ShapeError::Rank {
                index: 0,
                expected: ">= 2".to_string(),
                actual: input.shape.clone(),
            });
        }
        Ok(vec![input.clone().with_format(self.target)])
    }
}

/// Splits the input into `count` equal parts along `axis`.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitParam {
    pub axis: i64,
    pub count: usize,
}

impl Operator for SplitParam {
    const NAME: &'static str = "split";

    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        self.count
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        let input = &inputs[0];
        let axis = normalize_axis(&input.shape, self.axis)?;
        let dim = input.shape[axis];
        if self.count == 0 || dim % self.count as i64 != 0 {
            return Err(ShapeError::invalid(format!(
                "dimension {axis} of size {dim} cannot be split into {} parts",
                self.count
            )));
        }
        let part: Shape = input
            .shape
            .iter()
            .enumerate()
            .map(|(i, d)| if i == axis { d / self.count as i64 } else { *d })
            .collect();
        Ok(vec![input.with_shape(part); self.count])
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConcatParam {
    pub axis: i64,
}

impl Operator for ConcatParam {
    const NAME: &'static str = "concat";

    fn input_count(&self) -> usize {
        2
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        let (lhs, rhs) = (&inputs[0], &inputs[1]);
        expect_dtype(inputs, 1, lhs.dtype)?;
        let axis = normalize_axis(&lhs.shape, self.axis)?;
        if lhs.shape.rank() != rhs.shape.rank() {
            return Err(ShapeError::Rank {
                index: 1,
                expected: lhs.shape.rank().to_string(),
                actual: rhs.shape.clone(),
            });
        }
        let mut dims = Vec::with_capacity(lhs.shape.rank());
        for (i, (a, b)) in lhs.shape.iter().zip(rhs.shape.iter()).enumerate() {
            if i == axis {
                dims.push(a + b);
            } else if a != b {
                return Err(ShapeError::Dim {
                    index: 1,
                    axis: i,
                    expected: *a,
                    actual: *b,
                });
            } else {
                dims.push(*a);
            }
        }
        Ok(vec![lhs.with_shape(dims)])
    }
}

/// Gathers slices of the first input selected by integer indices.
#[derive(Clone, Debug, PartialEq)]
pub struct GatherParam {
    pub axis: i64,
}

impl Operator for GatherParam {
    const NAME: &'static str = "gather";

    fn input_count(&self) -> usize {
        2
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        let (table, indices) = (&inputs[0], &inputs[1]);
        if !matches!(indices.dtype, DataType::I32 | DataType::I64) {
            return Err(ShapeError::DataType {
                index: 1,
                expected: DataType::I32,
                actual: indices.dtype,
            });
        }
        let axis = normalize_axis(&table.shape, self.axis)?;
        let shape: Shape = table.shape[..axis]
            .iter()
            .chain(indices.shape.iter())
            .chain(table.shape[axis + 1..].iter())
            .copied()
            .collect();
        Ok(vec![table.with_shape(shape)])
    }
}
