use crate::{
    error::ShapeError,
    tensor::{DataType, Shape, TensorDesc},
};

use super::{expect_dim, expect_dtype, expect_float, normalize_axis, Operator};

/// Layer normalization over the dimensions from `begin_norm_axis` on.
///
/// Inputs are `x`, `gamma`, `beta`. With `with_stats` the kernel also writes
/// the per-row mean and reciprocal standard deviation as `f32`.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerNormParam {
    pub epsilon: f32,
    pub begin_norm_axis: i64,
    pub begin_params_axis: i64,
    pub with_stats: bool,
}

impl Default for LayerNormParam {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            begin_norm_axis: -1,
            begin_params_axis: -1,
            with_stats: false,
        }
    }
}

impl LayerNormParam {
    /// Product of the dimensions before the normalized axis.
    pub fn leading_elements(&self, x: &Shape) -> Result<i64, ShapeError> {
        let axis = normalize_axis(x, self.begin_norm_axis)?;
        Ok(Shape::from(&x[..axis]).element_count())
    }
}

impl Operator for LayerNormParam {
    const NAME: &'static str = "layer_norm";

    fn input_count(&self) -> usize {
        3
    }

    fn output_count(&self) -> usize {
        if self.with_stats {
            3
        } else {
            1
        }
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        expect_float(inputs, 0)?;
        let x = &inputs[0];
        let axis = normalize_axis(&x.shape, self.begin_norm_axis)?;
        let leading = self.leading_elements(&x.shape)?;
        if leading < 0 {
            return Err(ShapeError::invalid(format!(
                "leading dimension product {leading} of input {} is negative",
                x.shape
            )));
        }

        let params_axis = normalize_axis(&x.shape, self.begin_params_axis)?;
        let params_shape = &x.shape[params_axis..];
        for index in 1..3 {
            expect_dtype(inputs, index, x.dtype)?;
            let shape = &inputs[index].shape;
            if shape.dims() != params_shape {
                return Err(ShapeError::invalid(format!(
                    "input {index}: expected shape {}, got {shape}",
                    Shape::from(params_shape)
                )));
            }
        }

        let mut outputs = vec![TensorDesc::new(x.dtype, x.shape.clone())];
        if self.with_stats {
            let stats: Shape = x
                .shape
                .iter()
                .enumerate()
                .map(|(i, dim)| if i < axis { *dim } else { 1 })
                .collect();
            outputs.push(TensorDesc::new(DataType::F32, stats.clone()));
            outputs.push(TensorDesc::new(DataType::F32, stats));
        }
        Ok(outputs)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RmsNormParam {
    pub epsilon: f32,
}

impl Default for RmsNormParam {
    fn default() -> Self {
        Self { epsilon: 1e-6 }
    }
}

impl Operator for RmsNormParam {
    const NAME: &'static str = "rms_norm";

    fn input_count(&self) -> usize {
        2
    }

    fn infer_shape(&self, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, ShapeError> {
        expect_float(inputs, 0)?;
        expect_dtype(inputs, 1, inputs[0].dtype)?;
        let x = &inputs[0];
        let Some(&hidden) = x.shape.last() else {
            return Err(ShapeError::invalid("rms norm input must have rank >= 1"));
        };
        if inputs[1].shape.rank() != 1 {
            return Err(ShapeError::Rank {
                index: 1,
                expected: "1".to_string(),
                actual: inputs[1].shape.clone(),
            });
        }
        expect_dim(inputs, 1, 0, hidden)?;
        Ok(vec![TensorDesc::new(x.dtype, x.shape.clone())])
    }
}
