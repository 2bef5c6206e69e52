//! Minimal tensor container and the HWCN shape view.

use crate::error::ConfigError;

/// Feature-map shape in H x W x C x N order (batch innermost in memory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwcnShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub num: usize,
}

impl HwcnShape {
    pub fn new(height: usize, width: usize, channels: usize, num: usize) -> Self {
        Self { height, width, channels, num }
    }

    /// Interpret a 4-D blob shape `[H, W, C, N]`.
    pub fn from_dims(dims: &[usize]) -> Result<Self, ConfigError> {
        match *dims {
            [height, width, channels, num] => Ok(Self { height, width, channels, num }),
            _ => Err(ConfigError::ShapeRank(dims.to_vec())),
        }
    }

    pub fn dims(&self) -> Vec<usize> {
        vec![self.height, self.width, self.channels, self.num]
    }

    pub fn count(&self) -> usize {
        self.height * self.width * self.channels * self.num
    }

    /// Spatial positions per image.
    pub fn spatial(&self) -> usize {
        self.height * self.width
    }

    /// Linear offset of `(h, w, c, n)`.
    #[inline]
    pub fn offset(&self, h: usize, w: usize, c: usize, n: usize) -> usize {
        ((h * self.width + w) * self.channels + c) * self.num + n
    }
}

impl std::fmt::Display for HwcnShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}x{}", self.height, self.width, self.channels, self.num)
    }
}

/// Host tensor with a value buffer (`data`) and a gradient buffer (`diff`)
/// of identical shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob<T> {
    shape: Vec<usize>,
    data: Vec<T>,
    diff: Vec<T>,
}

impl<T: Copy + Default> Blob<T> {
    /// Zero-filled blob.
    pub fn new(shape: &[usize]) -> Self {
        let count = shape.iter().product();
        Self { shape: shape.to_vec(), data: vec![T::default(); count], diff: vec![T::default(); count] }
    }

    /// Blob wrapping existing values; the diff is zero-filled.
    pub fn from_data(shape: &[usize], data: Vec<T>) -> Result<Self, ConfigError> {
        let count: usize = shape.iter().product();
        if data.len() != count {
            return Err(ConfigError::DataLength {
                shape: shape.to_vec(),
                expected: count,
                got: data.len(),
            });
        }
        Ok(Self { shape: shape.to_vec(), diff: vec![T::default(); count], data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn count(&self) -> usize {
        self.data.len()
    }

    /// Resize to `shape`. Existing values are kept up to the new count and
    /// new elements are zero.
    pub fn reshape(&mut self, shape: &[usize]) {
        let count = shape.iter().product();
        self.shape = shape.to_vec();
        self.data.resize(count, T::default());
        self.diff.resize(count, T::default());
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn diff(&self) -> &[T] {
        &self.diff
    }

    pub fn diff_mut(&mut self) -> &mut [T] {
        &mut self.diff
    }

    /// Split borrow: read data while writing diff.
    pub fn data_and_diff_mut(&mut self) -> (&[T], &mut [T]) {
        (&self.data, &mut self.diff)
    }

    pub fn zero_diff(&mut self) {
        self.diff.fill(T::default());
    }

    /// View the shape as H x W x C x N.
    pub fn hwcn_shape(&self) -> Result<HwcnShape, ConfigError> {
        HwcnShape::from_dims(&self.shape)
    }
}
