use burn::tensor::{
    backend::Backend,
    module::{adaptive_avg_pool2d, interpolate},
    ops::{InterpolateMode, InterpolateOptions},
    Tensor,
};

/// Spatial resampling of feature maps in `[B, C, H, W]` layout.
///
/// Resampling to the current size returns the input untouched.
pub trait TensorResampleExtension {
    /// Downsample by averaging over the covered area.
    ///
    /// It equals adaptive average pooling.
    fn resize_area(
        self,
        size: [usize; 2],
    ) -> Self;

    /// Resample with bicubic interpolation.
    ///
    /// The corner pixels are aligned, so the sampling ratio is `(in - 1) / (out - 1)`.
    /// It differs from the half-pixel sampling where the ratio is `in / out`.
    fn resize_bicubic(
        self,
        size: [usize; 2],
    ) -> Self;
}

impl<B: Backend> TensorResampleExtension for Tensor<B, 4> {
    fn resize_area(
        self,
        size: [usize; 2],
    ) -> Self {
        let [_, _, h, w] = self.dims();
        if [h, w] == size {
            return self;
        }
        adaptive_avg_pool2d(self, size)
    }

    fn resize_bicubic(
        self,
        size: [usize; 2],
    ) -> Self {
        let [_, _, h, w] = self.dims();
        if [h, w] == size {
            return self;
        }
        interpolate(self, size, InterpolateOptions::new(InterpolateMode::Bicubic))
    }
}

/// `[B, C, H, W] -> [B * H * W, C]`
///
/// The rows are ordered by `(b, h, w)`.
pub fn feature_map_to_vectors<B: Backend>(map: Tensor<B, 4>) -> Tensor<B, 2> {
    let [b, c, h, w] = map.dims();
    map.swap_dims(1, 2).swap_dims(2, 3).reshape([b * h * w, c])
}

/// `[B * H * W, C] -> [B, C, H, W]`
///
/// The inverse of [`feature_map_to_vectors`].
pub fn vectors_to_feature_map<B: Backend>(
    vectors: Tensor<B, 2>,
    [b, h, w]: [usize; 3],
) -> Tensor<B, 4> {
    let [_, c] = vectors.dims();
    vectors.reshape([b, h, w, c]).swap_dims(2, 3).swap_dims(1, 2)
}
