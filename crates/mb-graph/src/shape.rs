use std::fmt;

use crate::dtype::DType;

/// Maximum tensor rank.
pub const MAX_DIMS: usize = 4;

/// A tensor extent of up to four dimensions, innermost first.
///
/// Unused trailing dimensions are 1, so `[768]` and `[768, 1, 1, 1]` are the
/// same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    ne: [usize; MAX_DIMS],
}

impl Shape {
    /// Create a shape from up to four extents.
    ///
    /// # Panics
    /// Panics if more than four extents are given.
    pub fn new(dims: &[usize]) -> Self {
        assert!(
            dims.len() <= MAX_DIMS,
            "shape of rank {} exceeds {}",
            dims.len(),
            MAX_DIMS
        );
        let mut ne = [1; MAX_DIMS];
        ne[..dims.len()].copy_from_slice(dims);
        Shape { ne }
    }

    pub fn from_ne(ne: [usize; MAX_DIMS]) -> Self {
        Shape { ne }
    }

    pub fn ne(&self) -> [usize; MAX_DIMS] {
        self.ne
    }

    /// Extent of dimension `i`.
    ///
    /// # Panics
    /// Panics if `i >= 4`.
    pub fn dim(&self, i: usize) -> usize {
        self.ne[i]
    }

    /// Rank ignoring trailing unit dimensions, at least 1.
    pub fn n_dims(&self) -> usize {
        self.ne
            .iter()
            .rposition(|&d| d != 1)
            .map_or(1, |i| i + 1)
    }

    /// Total number of elements, or `None` if it overflows `usize`.
    pub fn checked_numel(&self) -> Option<usize> {
        self.ne.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Number of rows (elements divided by the innermost extent), or `None`
    /// if it overflows `usize`.
    pub fn checked_nrows(&self) -> Option<usize> {
        self.ne[1..].iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Contiguous byte strides for this shape stored as `dtype`, or `None`
    /// if the tensor spans more than `usize::MAX` bytes.
    pub fn checked_strides(&self, dtype: DType) -> Option<[usize; MAX_DIMS]> {
        let mut nb = [0; MAX_DIMS];
        nb[0] = dtype.type_size();
        nb[1] = nb[0].checked_mul(self.ne[0] / dtype.block_size())?;
        nb[2] = nb[1].checked_mul(self.ne[1])?;
        nb[3] = nb[2].checked_mul(self.ne[2])?;
        // The full span must fit as well.
        nb[3].checked_mul(self.ne[3])?;
        Some(nb)
    }

    /// Byte size of a contiguous tensor of this shape, or `None` on overflow.
    pub fn checked_nbytes(&self, dtype: DType) -> Option<usize> {
        let nb = self.checked_strides(dtype)?;
        nb[3].checked_mul(self.ne[3])
    }

    /// Total number of elements. Saturates at `usize::MAX`.
    pub fn numel(&self) -> usize {
        self.checked_numel().unwrap_or(usize::MAX)
    }

    /// Number of rows. Saturates at `usize::MAX`.
    pub fn nrows(&self) -> usize {
        self.checked_nrows().unwrap_or(usize::MAX)
    }

    /// Contiguous byte strides. Graph nodes and weights only ever hold shapes
    /// whose [`checked_strides`](Self::checked_strides) succeeded; otherwise
    /// every stride is `usize::MAX`.
    pub fn strides(&self, dtype: DType) -> [usize; MAX_DIMS] {
        self.checked_strides(dtype).unwrap_or([usize::MAX; MAX_DIMS])
    }

    /// Byte size of a contiguous tensor of this shape. Saturates at
    /// `usize::MAX`.
    pub fn nbytes(&self, dtype: DType) -> usize {
        self.checked_nbytes(dtype).unwrap_or(usize::MAX)
    }

    /// True when every extent of `self` evenly divides the matching extent of
    /// `target`, so `self` can be broadcast onto it by repetition.
    pub fn can_repeat_onto(&self, target: &Shape) -> bool {
        self.ne
            .iter()
            .zip(target.ne.iter())
            .all(|(&s, &t)| s != 0 && t % s == 0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.ne[..self.n_dims()].iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(&dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_units_are_equal() {
        assert_eq!(Shape::new(&[768]), Shape::new(&[768, 1, 1, 1]));
        assert_eq!(Shape::new(&[768]).n_dims(), 1);
        assert_eq!(Shape::new(&[2, 1, 3]).n_dims(), 3);
        assert_eq!(Shape::new(&[]).n_dims(), 1);
    }

    #[test]
    fn test_numel_and_rows() {
        let s = Shape::new(&[4, 3, 2]);
        assert_eq!(s.numel(), 24);
        assert_eq!(s.nrows(), 6);
    }

    #[test]
    fn test_strides() {
        let s = Shape::new(&[4, 3, 2]);
        assert_eq!(s.strides(DType::F32), [4, 16, 48, 96]);
        assert_eq!(s.nbytes(DType::F32), 96);

        let q = Shape::new(&[64, 2]);
        assert_eq!(q.strides(DType::Q8_0), [34, 68, 136, 136]);
        assert_eq!(q.nbytes(DType::Q8_0), 136);
    }

    #[test]
    fn test_overflowing_extents() {
        let huge = Shape::new(&[1 << 31, 1 << 31, 3, 1]);
        assert!(huge.checked_numel().is_none());
        assert!(huge.checked_strides(DType::F32).is_none());
        assert!(huge.checked_nbytes(DType::F32).is_none());
        assert_eq!(huge.numel(), usize::MAX);
        assert_eq!(huge.nbytes(DType::F32), usize::MAX);

        let rows = Shape::new(&[1, usize::MAX, 2]);
        assert!(rows.checked_nrows().is_none());
        assert_eq!(rows.nrows(), usize::MAX);

        // Fits as elements but not as bytes.
        let wide = Shape::new(&[usize::MAX / 2]);
        assert!(wide.checked_numel().is_some());
        assert!(wide.checked_nbytes(DType::F32).is_none());
    }

    #[test]
    fn test_can_repeat() {
        let a = Shape::new(&[8, 4, 2]);
        assert!(Shape::new(&[8]).can_repeat_onto(&a));
        assert!(Shape::new(&[1, 1, 2]).can_repeat_onto(&a));
        assert!(!Shape::new(&[3]).can_repeat_onto(&a));
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::new(&[257, 1536, 1]).to_string(), "[257, 1536]");
        assert_eq!(Shape::new(&[1]).to_string(), "[1]");
    }
}
