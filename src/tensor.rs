use std::{
    fmt::{Debug, Display},
    ops::Deref,
};

use enumset::EnumSetType;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub const MAX_RANK: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F16,
    BF16,
    F32,
    F64,
    I8,
    U8,
    I32,
    I64,
    Bool,
}

impl DataType {
    pub const fn size_in_bytes(self) -> u64 {
        match self {
            DataType::I8 | DataType::U8 | DataType::Bool => 1,
            DataType::F16 | DataType::BF16 => 2,
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(
            self,
            DataType::F16 | DataType::BF16 | DataType::F32 | DataType::F64
        )
    }

    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::I8 | DataType::U8 | DataType::I32 | DataType::I64
        )
    }

    /// The WGSL scalar type, if the type can be stored in a storage buffer directly.
    pub const fn wgsl_type(self) -> Option<&'static str> {
        match self {
            DataType::F32 => Some("f32"),
            DataType::F16 => Some("f16"),
            DataType::I32 => Some("i32"),
            _ => None,
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I8 => "i8",
            DataType::U8 => "u8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Physical layout tag carried by every tensor descriptor.
///
/// Operators declare which tags they accept per input. Converting between
/// tags takes an explicit `trans_data` node.
#[derive(EnumSetType, Debug, Hash, Serialize, Deserialize)]
pub enum TensorFormat {
    /// Logical row-major layout.
    RowMajor,
    /// Hardware-native tiled layout, typically used for matmul weights.
    Tiled,
}

impl Display for TensorFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TensorFormat::RowMajor => f.write_str("row-major"),
            TensorFormat::Tiled => f.write_str("tiled"),
        }
    }
}

/// Ordered dimension sizes.
///
/// Dimensions are signed: callers may bind placeholder dims (`-1`) and an
/// unresolved internal tensor has an empty shape until setup fills it in.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Shape(SmallVec<[i64; MAX_RANK]>);

impl Shape {
    pub fn new(dims: impl IntoIterator<Item = i64>) -> Self {
        Self(dims.into_iter().collect())
    }

    pub fn scalar() -> Self {
        Self(SmallVec::new())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[i64] {
        &self.0
    }

    /// Product of all dimensions, negative if any placeholder dim is present.
    /// Saturates at the `i64` bounds.
    pub fn element_count(&self) -> i64 {
        self.0.iter().fold(1i64, |acc, dim| acc.saturating_mul(*dim))
    }

    /// Product of all dimensions, `None` if it does not fit an `i64`.
    pub fn checked_element_count(&self) -> Option<i64> {
        self.0.iter().try_fold(1i64, |acc, dim| acc.checked_mul(*dim))
    }

    pub fn is_resolved(&self) -> bool {
        self.0.iter().all(|dim| *dim >= 0)
    }

    /// Normalizes a possibly negative axis against this shape's rank.
    pub fn axis(&self, axis: i64) -> Option<usize> {
        let rank = self.rank() as i64;
        let axis = if axis < 0 { axis + rank } else { axis };
        (0..rank).contains(&axis).then_some(axis as usize)
    }

    /// Row-major strides in elements.
    pub fn contiguous_strides(&self) -> SmallVec<[i64; MAX_RANK]> {
        let mut acc = 1;
        let mut strides: SmallVec<[i64; MAX_RANK]> = SmallVec::from_elem(0, self.rank());
        for i in (0..self.rank()).rev() {
            strides[i] = acc;
            acc = acc.saturating_mul(self.0[i]);
        }
        strides
    }

    pub fn push(&mut self, dim: i64) {
        self.0.push(dim);
    }
}

impl Deref for Shape {
    type Target = [i64];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const N: usize> From<[i64; N]> for Shape {
    fn from(value: [i64; N]) -> Self {
        Self::new(value)
    }
}

impl From<&[i64]> for Shape {
    fn from(value: &[i64]) -> Self {
        Self::new(value.iter().copied())
    }
}

impl From<Vec<i64>> for Shape {
    fn from(value: Vec<i64>) -> Self {
        Self::new(value)
    }
}

impl FromIterator<i64> for Shape {
    fn from_iter<T: IntoIterator<Item = i64>>(iter: T) -> Self {
        Self::new(iter)
    }
}

impl Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[")?;
        for (i, dim) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    pub dtype: DataType,
    pub format: TensorFormat,
    pub shape: Shape,
}

impl TensorDesc {
    pub fn new(dtype: DataType, shape: impl Into<Shape>) -> Self {
        Self {
            dtype,
            format: TensorFormat::RowMajor,
            shape: shape.into(),
        }
    }

    pub fn with_format(mut self, format: TensorFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_shape(&self, shape: impl Into<Shape>) -> Self {
        Self {
            dtype: self.dtype,
            format: self.format,
            shape: shape.into(),
        }
    }

    /// Byte size of the described tensor, `None` while any dim is unresolved
    /// or when the size does not fit a `u64`.
    pub fn byte_size(&self) -> Option<u64> {
        if !self.shape.is_resolved() {
            return None;
        }
        let count = u64::try_from(self.shape.checked_element_count()?).ok()?;
        count.checked_mul(self.dtype.size_in_bytes())
    }

    /// A resolved shape whose byte size cannot be represented.
    pub fn overflows(&self) -> bool {
        self.shape.is_resolved() && self.byte_size().is_none()
    }
}

impl Display for TensorDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{} ({})", self.dtype, self.shape, self.format)
    }
}

/// A raw device address. The engine only ever offsets it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    pub const fn addr(self) -> u64 {
        self.0
    }
}

impl Debug for DevicePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Display for DevicePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A contiguous device byte range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceSpan {
    pub ptr: DevicePtr,
    pub len: u64,
}

impl DeviceSpan {
    pub const fn new(ptr: DevicePtr, len: u64) -> Self {
        Self { ptr, len }
    }

    pub const fn end(&self) -> u64 {
        self.ptr.0 + self.len
    }

    /// A sub range starting `offset` bytes in.
    pub fn slice(&self, offset: u64, len: u64) -> Option<Self> {
        (offset.checked_add(len)? <= self.len).then(|| Self::new(self.ptr.offset(offset), len))
    }
}

/// Where a tensor's bytes live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Memory {
    #[default]
    Unbound,
    /// Caller-owned device memory. The engine never frees it.
    External(DevicePtr),
    /// A range of the runner's workspace, valid for one execute call.
    Workspace { offset: u64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub desc: TensorDesc,
    pub memory: Memory,
}

impl Tensor {
    pub fn external(desc: TensorDesc, ptr: DevicePtr) -> Self {
        Self {
            desc,
            memory: Memory::External(ptr),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.memory, Memory::Workspace { .. })
    }

    pub fn byte_size(&self) -> Option<u64> {
        self.desc.byte_size()
    }
}

#[cfg(test)]
#[test]
fn test_shape_helpers() {
    let shape = Shape::from([2, 3, 4]);
    assert_eq!(shape.rank(), 3);
    assert_eq!(shape.element_count(), 24);
    assert_eq!(shape.axis(-1), Some(2));
    assert_eq!(shape.axis(3), None);
    assert_eq!(shape.contiguous_strides().as_slice(), &[12, 4, 1]);
    assert_eq!(shape.to_string(), "[2, 3, 4]");

    let placeholder = Shape::from([-1, 4]);
    assert!(!placeholder.is_resolved());
    assert_eq!(placeholder.element_count(), -4);
}

#[cfg(test)]
#[test]
fn test_desc_byte_size() {
    let desc = TensorDesc::new(DataType::F16, [2, 4]);
    assert_eq!(desc.byte_size(), Some(16));
    assert_eq!(TensorDesc::new(DataType::F32, [-1, 4]).byte_size(), None);

    let huge = TensorDesc::new(DataType::F32, [1 << 40, 1 << 40]);
    assert_eq!(huge.shape.checked_element_count(), None);
    assert_eq!(huge.shape.element_count(), i64::MAX);
    assert_eq!(huge.byte_size(), None);
    assert!(huge.overflows());
    assert!(!TensorDesc::new(DataType::F32, [-1, 1 << 40]).overflows());
    // fits an i64 element count but not a u64 byte size
    let wide = TensorDesc::new(DataType::I64, [1 << 31, 1 << 31]);
    assert_eq!(wide.shape.checked_element_count(), Some(1 << 62));
    assert_eq!(wide.byte_size(), None);

    let span = DeviceSpan::new(DevicePtr(0x100), 64);
    assert_eq!(span.slice(16, 48).map(|s| s.ptr), Some(DevicePtr(0x110)));
    assert_eq!(span.slice(32, 48), None);
}
