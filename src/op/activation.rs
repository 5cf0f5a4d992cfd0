use crate::{error::ShapeError, tensor::TensorDesc};

use super::{expect_float, Operator};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    Relu,
    Gelu,
    FastGelu,
    Silu,
    Sigmoid,
    /// `silu(x[.., :h]) * x[.., h:]`, halving the last dimension.
    Swiglu,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActivationParam {
    pub kind: ActivationKind,
}

impl ActivationParam {
    pub fn new(kind: ActivationKind) -> Self {
        Self { kind }
    }
}

impl Operator for ActivationParam {
    const NAME: &'static str = "activation";

    fn input_count(&self) -> usize {
        1
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        expect_float(inputs, 0)?;
        let x = &inputs[0];
        if self.kind != ActivationKind::Swiglu {
            return Ok(vec![x.clone()]);
        }
        let mut shape = x.shape.clone();
        let Some(last) = shape.rank().checked_sub(1) else {
            return Err(ShapeError::invalid("swiglu needs an input of rank >= 1"));
        };
        let hidden = shape[last];
        if hidden % 2 != 0 {
            return Err(ShapeError::invalid(format!(
                "swiglu needs an even last dimension, got {hidden}"
            )));
        }
        let dims: Vec<i64> = shape
            .iter()
            .enumerate()
            .map(|(i, dim)| if i == last { dim / 2 } else { *dim })
            .collect();
        shape = dims.into();
        Ok(vec![x.with_shape(shape)])
    }
}

#[cfg(test)]
#[test]
fn test_swiglu_halves_last_dim() {
    use crate::tensor::{DataType, Shape};

    let param = ActivationParam::new(ActivationKind::Swiglu);
    let out = param
        .infer_shape(&[TensorDesc::new(DataType::F32, [3, 16])])
        .unwrap();
    assert_eq!(out[0].shape, Shape::from([3, 8]));
    assert!(param
        .infer_shape(&[TensorDesc::new(DataType::F32, [3, 5])])
        .is_err());
    assert!(ActivationParam::new(ActivationKind::Gelu)
        .infer_shape(&[TensorDesc::new(DataType::I32, [3])])
        .is_err());
}
