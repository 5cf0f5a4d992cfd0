//! Operator parameter blobs and their shape rules.
//!
//! A node's operator identity and parameters are one [`OpParam`] value. The
//! set of operator families is closed so that a dynamic update aimed at the
//! wrong family is a typed lookup failure instead of a runtime type-id check.

use std::fmt::Debug;

use enumset::EnumSet;

use crate::{
    error::ShapeError,
    tensor::{DataType, Shape, TensorDesc, TensorFormat},
};

mod activation;
mod attention;
mod elewise;
mod layout;
mod matmul;
mod norm;

pub use activation::{ActivationKind, ActivationParam};
pub use attention::{RopeParam, SelfAttentionParam, SoftmaxParam};
pub use elewise::{ElewiseKind, ElewiseParam};
pub use layout::{
    AsStridedParam, ConcatParam, GatherParam, SplitParam, TransDataParam, TransposeParam,
};
pub use matmul::{MatMulExtents, MatMulParam};
pub use norm::{LayerNormParam, RmsNormParam};

/// Shape rules of one operator family.
pub trait Operator: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Operator identity handed to the kernel registry.
    const NAME: &'static str;

    fn input_count(&self) -> usize;

    fn output_count(&self) -> usize {
        1
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError>;

    fn accepted_formats(&self, _input: usize) -> EnumSet<TensorFormat> {
        EnumSet::only(TensorFormat::RowMajor)
    }

    /// Extra device scratch the kernel needs while it runs.
    fn scratch_bytes(&self, _inputs: &[TensorDesc]) -> u64 {
        0
    }
}

/// Typed access to one variant of [`OpParam`].
pub trait OpFamily: Operator + Into<OpParam> {
    fn from_param(param: &OpParam) -> Option<&Self>;

    fn from_param_mut(param: &mut OpParam) -> Option<&mut Self>;
}

macro_rules! op_params {
    ($($variant:ident($param:ty)),* $(,)?) => {
        #[derive(Clone, Debug, PartialEq)]
        pub enum OpParam {
            $($variant($param),)*
        }

        impl OpParam {
            pub fn name(&self) -> &'static str {
                match self {
                    $(OpParam::$variant(_) => <$param as Operator>::NAME,)*
                }
            }

            pub fn input_count(&self) -> usize {
                match self {
                    $(OpParam::$variant(param) => param.input_count(),)*
                }
            }

            pub fn output_count(&self) -> usize {
                match self {
                    $(OpParam::$variant(param) => param.output_count(),)*
                }
            }

            fn infer_unchecked(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
                match self {
                    $(OpParam::$variant(param) => param.infer_shape(inputs),)*
                }
            }

            pub fn accepted_formats(&self, input: usize) -> EnumSet<TensorFormat> {
                match self {
                    $(OpParam::$variant(param) => param.accepted_formats(input),)*
                }
            }

            pub fn scratch_bytes(&self, inputs: &[TensorDesc]) -> u64 {
                match self {
                    $(OpParam::$variant(param) => param.scratch_bytes(inputs),)*
                }
            }
        }

        $(
            impl From<$param> for OpParam {
                fn from(value: $param) -> Self {
                    OpParam::$variant(value)
                }
            }

            impl OpFamily for $param {
                fn from_param(param: &OpParam) -> Option<&Self> {
                    match param {
                        OpParam::$variant(inner) => Some(inner),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }

                fn from_param_mut(param: &mut OpParam) -> Option<&mut Self> {
                    match param {
                        OpParam::$variant(inner) => Some(inner),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }
        )*
    };
}

op_params! {
    Elewise(ElewiseParam),
    LayerNorm(LayerNormParam),
    RmsNorm(RmsNormParam),
    MatMul(MatMulParam),
    Activation(ActivationParam),
    Softmax(SoftmaxParam),
    AsStrided(AsStridedParam),
    Transpose(TransposeParam),
    TransData(TransDataParam),
    Split(SplitParam),
    Concat(ConcatParam),
    Gather(GatherParam),
    Rope(RopeParam),
    SelfAttention(SelfAttentionParam),
}

impl OpParam {
    /// Checks arity and input formats, then runs the family's shape rule.
    pub fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        expect_inputs(inputs, self.input_count())?;
        for (index, input) in inputs.iter().enumerate() {
            if !self.accepted_formats(index).contains(input.format) {
                return Err(ShapeError::Format {
                    index,
                    actual: input.format,
                });
            }
        }
        let outputs = self.infer_unchecked(inputs)?;
        debug_assert_eq!(outputs.len(), self.output_count());
        Ok(outputs)
    }

    pub fn get<P: OpFamily>(&self) -> Option<&P> {
        P::from_param(self)
    }

    pub fn get_mut<P: OpFamily>(&mut self) -> Option<&mut P> {
        P::from_param_mut(self)
    }

    /// Like [`OpParam::get_mut`] but reports which family was found instead.
    pub fn expect_mut<P: OpFamily>(&mut self) -> Result<&mut P, ShapeError> {
        let found = self.name();
        P::from_param_mut(self).ok_or(ShapeError::Param {
            expected: P::NAME,
            found,
        })
    }
}

pub(crate) fn expect_inputs(inputs: &[TensorDesc], expected: usize) -> Result<(), ShapeError> {
    if inputs.len() != expected {
        return Err(ShapeError::InputCount {
            expected,
            actual: inputs.len(),
        });
    }
    Ok(())
}

pub(crate) fn expect_rank(
    inputs: &[TensorDesc],
    index: usize,
    rank: usize,
) -> Result<(), ShapeError> {
    let shape = &inputs[index].shape;
    if shape.rank() != rank {
        return Err(ShapeError::Rank {
            index,
            expected: rank.to_string(),
            actual: shape.clone(),
        });
    }
    Ok(())
}

pub(crate) fn expect_dtype(
    inputs: &[TensorDesc],
    index: usize,
    expected: DataType,
) -> Result<(), ShapeError> {
    let actual = inputs[index].dtype;
    if actual != expected {
        return Err(ShapeError::DataType {
            index,
            expected,
            actual,
        });
    }
    Ok(())
}

pub(crate) fn expect_float(inputs: &[TensorDesc], index: usize) -> Result<(), ShapeError> {
    let dtype = inputs[index].dtype;
    if !dtype.is_float() {
        return Err(ShapeError::invalid(format!(
            "input {index}: expected a floating point dtype, got {dtype}"
        )));
    }
    Ok(())
}

pub(crate) fn expect_dim(
    inputs: &[TensorDesc],
    index: usize,
    axis: usize,
    expected: i64,
) -> Result<(), ShapeError> {
    let actual = inputs[index].shape[axis];
    if actual != expected {
        return Err(ShapeError::Dim {
            index,
            axis,
            expected,
            actual,
        });
    }
    Ok(())
}

pub(crate) fn normalize_axis(shape: &Shape, axis: i64) -> Result<usize, ShapeError> {
    shape.axis(axis).ok_or(ShapeError::Axis {
        axis,
        rank: shape.rank(),
    })
}

/// Numpy-style broadcast of two shapes, aligned from the trailing dimension.
pub fn broadcast(lhs: &Shape, rhs: &Shape) -> Result<Shape, ShapeError> {
    let rank = lhs.rank().max(rhs.rank());
    let dim = |shape: &Shape, i: usize| {
        let pad = rank - shape.rank();
        if i < pad {
            1
        } else {
            shape[i - pad]
        }
    };
    (0..rank)
        .map(|i| match (dim(lhs, i), dim(rhs, i)) {
            (a, b) if a == b => Ok(a),
            (1, b) => Ok(b),
            (a, 1) => Ok(a),
            _ => Err(ShapeError::Broadcast {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
            }),
        })
        .collect()
}
