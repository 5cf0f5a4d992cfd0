use crate::{
    error::ShapeError,
    tensor::{DataType, TensorDesc},
};

use super::{broadcast, expect_dtype, expect_float, Operator};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ElewiseKind {
    Add,
    Sub,
    Mul,
    RealDiv,
    /// Multiply by a scalar.
    Muls(f32),
    Cast(DataType),
}

impl ElewiseKind {
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            ElewiseKind::Add | ElewiseKind::Sub | ElewiseKind::Mul | ElewiseKind::RealDiv
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ElewiseParam {
    pub kind: ElewiseKind,
}

impl ElewiseParam {
    pub fn new(kind: ElewiseKind) -> Self {
        Self { kind }
    }
}

impl Operator for ElewiseParam {
    const NAME: &'static str = "elewise";

    fn input_count(&self) -> usize {
        if self.kind.is_binary() {
            2
        } else {
            1
        }
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        let first = &inputs[0];
        let output = match self.kind {
            ElewiseKind::Cast(dtype) => TensorDesc::new(dtype, first.shape.clone()),
            ElewiseKind::Muls(_) => {
                expect_float(inputs, 0)?;
                TensorDesc::new(first.dtype, first.shape.clone())
            }
            _ => {
                expect_dtype(inputs, 1, first.dtype)?;
                let shape = broadcast(&first.shape, &inputs[1].shape)?;
                TensorDesc::new(first.dtype, shape)
            }
        };
        Ok(vec![output])
    }
}

#[cfg(test)]
#[test]
fn test_elewise_infer() {
    let add = ElewiseParam::new(ElewiseKind::Add);
    let out = add
        .infer_shape(&[
            TensorDesc::new(DataType::F32, [2, 4]),
            TensorDesc::new(DataType::F32, [4]),
        ])
        .unwrap();
    assert_eq!(out, vec![TensorDesc::new(DataType::F32, [2, 4])]);

    let err = add
        .infer_shape(&[
            TensorDesc::new(DataType::F32, [2, 4]),
            TensorDesc::new(DataType::F16, [2, 4]),
        ])
        .unwrap_err();
    assert_eq!(
        err,
        ShapeError::DataType {
            index: 1,
            expected: DataType::F32,
            actual: DataType::F16
        }
    );

    let cast = ElewiseParam::new(ElewiseKind::Cast(DataType::F16));
    assert_eq!(cast.input_count(), 1);
    let out = cast
        .infer_shape(&[TensorDesc::new(DataType::F32, [3])])
        .unwrap();
    assert_eq!(out[0].dtype, DataType::F16);
}
