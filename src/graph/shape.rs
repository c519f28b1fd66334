use std::fmt;

use crate::error::{OpsError, Result};

/// One static dimension: `Some(n)` when known at graph-construction time,
/// `None` when it is only determined by what the session is fed.
pub type Dim = Option<usize>;

/// Static shape of a graph tensor. May contain unknown dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: Vec<Dim>,
}

impl Shape {
    pub fn new(dims: Vec<Dim>) -> Shape {
        Shape { dims }
    }

    /// Fully known shape.
    pub fn known(dims: &[usize]) -> Shape {
        Shape { dims: dims.iter().map(|&d| Some(d)).collect() }
    }

    pub fn scalar() -> Shape {
        Shape { dims: vec![] }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Dim {
        self.dims.get(axis).copied().flatten()
    }

    pub fn last(&self) -> Dim {
        self.dims.last().copied().flatten()
    }

    pub fn is_fully_known(&self) -> bool {
        self.dims.iter().all(|d| d.is_some())
    }

    /// Concrete dimensions, or `None` if any dimension is unknown.
    pub fn to_concrete(&self) -> Option<Vec<usize>> {
        self.dims.iter().copied().collect()
    }

    pub fn num_elements(&self) -> Option<usize> {
        self.to_concrete().map(|d| d.iter().product())
    }

    /// Dimensions with unknowns encoded as -1.
    pub fn as_i64(&self) -> Vec<i64> {
        self.dims.iter().map(|d| d.map(|n| n as i64).unwrap_or(-1)).collect()
    }

    /// True if a concrete shape could be a value of this static shape.
    pub fn accepts(&self, concrete: &[usize]) -> bool {
        self.dims.len() == concrete.len()
            && self.dims.iter().zip(concrete).all(|(d, &c)| d.map_or(true, |n| n == c))
    }

    /// Resolves a possibly negative axis against this rank.
    pub fn axis(&self, axis: isize, operation: &str) -> Result<usize> {
        let rank = self.rank() as isize;
        let resolved = if axis < 0 { axis + rank } else { axis };
        if resolved < 0 || resolved >= rank {
            return Err(OpsError::shape_mismatch(
                operation,
                format!("axis in [-{rank}, {rank})"),
                axis,
            ));
        }
        Ok(resolved as usize)
    }

    /// Numpy-style broadcast of two static shapes.
    pub fn broadcast(&self, other: &Shape, operation: &str) -> Result<Shape> {
        let rank = self.rank().max(other.rank());
        let mut dims = Vec::with_capacity(rank);
        for i in 0..rank {
            let a = pad_dim(&self.dims, rank, i);
            let b = pad_dim(&other.dims, rank, i);
            let d = match (a, b) {
                (Some(1), x) | (x, Some(1)) => x,
                (Some(x), Some(y)) if x == y => Some(x),
                (Some(x), Some(y)) => {
                    return Err(OpsError::shape_mismatch(
                        operation,
                        format!("broadcastable dimensions at axis {i}"),
                        format!("{x} vs {y}"),
                    ))
                }
                (Some(x), None) | (None, Some(x)) => Some(x),
                (None, None) => None,
            };
            dims.push(d);
        }
        Ok(Shape { dims })
    }
}

fn pad_dim(dims: &[Dim], rank: usize, i: usize) -> Dim {
    let offset = rank - dims.len();
    if i < offset { Some(1) } else { dims[i - offset] }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::known(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::known(&dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match d {
                Some(n) => write!(f, "{n}")?,
                None => f.write_str("?")?,
            }
        }
        f.write_str("]")
    }
}
