//! Fundamental identifiers and tensor metadata types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit IEEE float.
    F32,
    /// 64-bit IEEE float.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// Unsigned byte.
    U8,
    /// Boolean stored as one byte.
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size_of(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 | DType::Bool => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::Bool => "bool",
        };
        write!(f, "{name}")
    }
}

/// Dimension value marking an unknown (dynamic) extent.
pub const DYNAMIC_DIM: i64 = -1;

/// Tensor shape as an ordered sequence of signed dimensions.
///
/// A dimension of [`DYNAMIC_DIM`] means the extent is unknown until resize
/// propagation resolves it for the current execution epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(Vec<i64>);

impl Shape {
    /// Create a shape from dimensions.
    pub fn new(dims: impl Into<Vec<i64>>) -> Self {
        Self(dims.into())
    }

    /// Scalar shape (rank 0).
    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    /// Dimensions in order.
    pub fn dims(&self) -> &[i64] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Whether every dimension is concrete.
    pub fn is_static(&self) -> bool {
        self.0.iter().all(|&d| d >= 0)
    }

    /// Total element count, or `None` while any dimension is dynamic.
    pub fn numel(&self) -> Option<usize> {
        if !self.is_static() {
            return None;
        }
        Some(self.0.iter().map(|&d| d as usize).product())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if *d == DYNAMIC_DIM {
                write!(f, "?")?;
            } else {
                write!(f, "{d}")?;
            }
        }
        write!(f, "]")
    }
}

impl From<Vec<i64>> for Shape {
    fn from(dims: Vec<i64>) -> Self {
        Self(dims)
    }
}

impl From<&[i64]> for Shape {
    fn from(dims: &[i64]) -> Self {
        Self(dims.to_vec())
    }
}

/// Identifier of a node in the kernel graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A produced tensor: output `index` of node `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorKey {
    /// Producing node.
    pub node: NodeId,
    /// Output index on the producing node.
    pub index: usize,
}

impl TensorKey {
    /// Create a tensor key.
    pub fn new(node: NodeId, index: usize) -> Self {
        Self { node, index }
    }
}

impl fmt::Display for TensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.index)
    }
}

/// Zero-size payload carried on control (monad) edges.
///
/// Control edges enforce execution order without transferring data; giving
/// them a payload type lets the scheduler's "all input slots filled" rule
/// cover data and ordering dependencies uniformly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlToken;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::F32.size_of(), 4);
        assert_eq!(DType::I64.size_of(), 8);
        assert_eq!(DType::Bool.size_of(), 1);
    }

    #[test]
    fn test_static_shape_numel() {
        let s = Shape::new(vec![2, 3]);
        assert!(s.is_static());
        assert_eq!(s.numel(), Some(6));
    }

    #[test]
    fn test_dynamic_shape_has_no_numel() {
        let s = Shape::new(vec![DYNAMIC_DIM, 3]);
        assert!(!s.is_static());
        assert_eq!(s.numel(), None);
        assert_eq!(s.to_string(), "[?,3]");
    }

    #[test]
    fn test_scalar_numel() {
        assert_eq!(Shape::scalar().numel(), Some(1));
    }

    #[test]
    fn test_dtype_serde_round_trip() {
        let json = serde_json::to_string(&DType::F32).unwrap();
        let back: DType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DType::F32);
    }
}
