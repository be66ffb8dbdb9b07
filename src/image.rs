//! Raster containers for per-pixel relocaliser data.
//!
//! Everything the relocaliser consumes or produces per frame is a dense W×H
//! image addressed by raster index `y * width + x`. The containers here are
//! deliberately plain: contiguous `Vec` storage, no interior mutability, so
//! they can be handed to the dispatch layer as flat slices.

use nalgebra::Vector3;

/// A generic dense W×H raster.
#[derive(Debug, Clone)]
pub struct Image<T> {
    width: usize,
    height: usize,
    data: Vec<T>,
}

impl<T> Image<T> {
    /// Build an image from existing raster-ordered data.
    ///
    /// Returns `None` if `data.len() != width * height`.
    pub fn from_raw(width: usize, height: usize, data: Vec<T>) -> Option<Self> {
        (data.len() == width * height).then_some(Self { width, height, data })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.data.get(index)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: Clone> Image<T> {
    /// Build an image with every pixel set to `fill`.
    pub fn filled(width: usize, height: usize, fill: T) -> Self {
        Self {
            width,
            height,
            data: vec![fill; width * height],
        }
    }
}

/// A single RGB-D keypoint: eye-space position, colour, validity.
///
/// Invalid keypoints occupy their raster slot but carry no usable geometry;
/// downstream samplers must check `valid` before touching `position`.
#[derive(Debug, Clone, Copy)]
pub struct Keypoint {
    /// 3D position in the camera (eye) frame, metres.
    pub position: Vector3<f64>,
    /// RGB colour sample, used only as a forest input feature.
    pub colour: [u8; 3],
    /// Whether this pixel produced a usable depth sample.
    pub valid: bool,
}

impl Default for Keypoint {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            colour: [0; 3],
            valid: false,
        }
    }
}

/// Per-pixel keypoints for one frame.
pub type KeypointImage = Image<Keypoint>;

/// Per-pixel feature vectors, `feature_count` contiguous f32 values per pixel.
#[derive(Debug, Clone)]
pub struct DescriptorImage {
    width: usize,
    height: usize,
    feature_count: usize,
    data: Vec<f32>,
}

impl DescriptorImage {
    /// Build a descriptor image from raster-ordered feature data.
    ///
    /// Returns `None` if `data.len() != width * height * feature_count`.
    pub fn from_raw(
        width: usize,
        height: usize,
        feature_count: usize,
        data: Vec<f32>,
    ) -> Option<Self> {
        (data.len() == width * height * feature_count).then_some(Self {
            width,
            height,
            feature_count,
            data,
        })
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn feature_count(&self) -> usize {
        self.feature_count
    }

    /// The feature vector of the pixel at `raster` index.
    pub fn features(&self, raster: usize) -> &[f32] {
        let start = raster * self.feature_count;
        &self.data[start..start + self.feature_count]
    }
}

/// Per-pixel leaf indices, one u32 per tree, trees contiguous per pixel.
#[derive(Debug, Clone)]
pub struct LeafImage {
    width: usize,
    height: usize,
    tree_count: usize,
    data: Vec<u32>,
}

impl LeafImage {
    pub fn new(width: usize, height: usize, tree_count: usize) -> Self {
        Self {
            width,
            height,
            tree_count,
            data: vec![0; width * height * tree_count],
        }
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn tree_count(&self) -> usize {
        self.tree_count
    }

    /// The leaf index vector of the pixel at `raster` index.
    pub fn leaves(&self, raster: usize) -> &[u32] {
        let start = raster * self.tree_count;
        &self.data[start..start + self.tree_count]
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u32] {
        &mut self.data
    }

    /// Resize in place for a new frame geometry, reusing the allocation.
    pub(crate) fn reset(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.data.clear();
        self.data.resize(width * height * self.tree_count, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raster_addressing() {
        let mut img = Image::filled(4, 3, 0u32);
        img.as_mut_slice()[2 * 4 + 1] = 7;
        assert_eq!(*img.get(9).unwrap(), 7);
        assert_eq!(img.dims(), (4, 3));
        assert_eq!(img.len(), 12);
    }

    #[test]
    fn from_raw_checks_length() {
        assert!(Image::from_raw(2, 2, vec![0u8; 4]).is_some());
        assert!(Image::from_raw(2, 2, vec![0u8; 5]).is_none());
        assert!(DescriptorImage::from_raw(2, 2, 3, vec![0.0; 12]).is_some());
        assert!(DescriptorImage::from_raw(2, 2, 3, vec![0.0; 11]).is_none());
    }

    #[test]
    fn descriptor_feature_slices() {
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let img = DescriptorImage::from_raw(2, 2, 3, data).unwrap();
        assert_eq!(img.features(0), &[0.0, 1.0, 2.0]);
        assert_eq!(img.features(3), &[9.0, 10.0, 11.0]);
    }

    #[test]
    fn leaf_image_reset_reuses_layout() {
        let mut img = LeafImage::new(2, 2, 5);
        assert_eq!(img.leaves(3).len(), 5);
        img.reset(3, 1);
        assert_eq!(img.dims(), (3, 1));
        assert_eq!(img.leaves(2), &[0, 0, 0, 0, 0]);
    }
}
