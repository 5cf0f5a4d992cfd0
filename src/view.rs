//! Non-copying logical reshapes applied to a node input before inference and dispatch.

use std::{fmt::Debug, sync::Arc};

use crate::tensor::Shape;

/// A pure `old dims -> new dims` function attached to one node input.
///
/// The function must keep the element count. Any context (a head count, a
/// fixed target shape) is captured by value when the graph is built.
#[derive(Clone)]
pub struct ViewFn {
    name: &'static str,
    function: Arc<dyn Fn(&Shape) -> Shape + Send + Sync>,
}

impl ViewFn {
    pub fn new(f: impl Fn(&Shape) -> Shape + Send + Sync + 'static) -> Self {
        Self {
            name: "view",
            function: Arc::new(f),
        }
    }

    fn named(name: &'static str, f: impl Fn(&Shape) -> Shape + Send + Sync + 'static) -> Self {
        Self {
            name,
            function: Arc::new(f),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(&self, shape: &Shape) -> Shape {
        (self.function)(shape)
    }

    /// `[d0, .., dn-1, dn] -> [d0 * .. * dn-1, dn]`
    pub fn flatten_leading() -> Self {
        Self::named("flatten_leading", |shape| match shape.split_last() {
            Some((last, leading)) => Shape::from([Shape::from(leading).element_count(), *last]),
            None => shape.clone(),
        })
    }

    /// `[.., h * d] -> [.., heads, d]`
    pub fn split_last(heads: i64) -> Self {
        Self::named("split_last", move |shape| {
            let mut dims: Vec<i64> = shape.to_vec();
            match dims.pop() {
                Some(last) if heads > 0 => {
                    dims.push(heads);
                    dims.push(last / heads);
                    Shape::from(dims)
                }
                _ => shape.clone(),
            }
        })
    }

    /// `[.., a, b] -> [.., a * b]`
    pub fn merge_last_two() -> Self {
        Self::named("merge_last_two", |shape| {
            if shape.rank() < 2 {
                return shape.clone();
            }
            let mut dims: Vec<i64> = shape[..shape.rank() - 2].to_vec();
            dims.push(shape[shape.rank() - 2].saturating_mul(shape[shape.rank() - 1]));
            Shape::from(dims)
        })
    }

    /// Reshape to `dims`; a single `-1` is inferred from the element count.
    pub fn reshape(dims: impl Into<Shape>) -> Self {
        let target: Shape = dims.into();
        Self::named("reshape", move |shape| {
            let known = Shape::new(target.iter().copied().filter(|dim| *dim != -1)).element_count();
            let inferred = match known {
                0 => 0,
                known => shape.element_count() / known,
            };
            target
                .iter()
                .map(|dim| if *dim == -1 { inferred } else { *dim })
                .collect()
        })
    }

    pub fn unsqueeze(axis: usize) -> Self {
        Self::named("unsqueeze", move |shape| {
            let mut dims: Vec<i64> = shape.to_vec();
            dims.insert(axis.min(dims.len()), 1);
            Shape::from(dims)
        })
    }

    /// Drops `axis` if it has size one.
    pub fn squeeze(axis: usize) -> Self {
        Self::named("squeeze", move |shape| {
            let mut dims: Vec<i64> = shape.to_vec();
            if dims.get(axis) == Some(&1) {
                dims.remove(axis);
            }
            Shape::from(dims)
        })
    }
}

impl Debug for ViewFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ViewFn({})", self.name)
    }
}
