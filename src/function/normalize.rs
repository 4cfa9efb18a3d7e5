use burn::tensor::{backend::Backend, Tensor};

/// Lower bound of the norm in [`TensorNormalizeExtension::normalize_l2`].
pub const NORM_EPSILON: f64 = 1e-12;

pub trait TensorNormalizeExtension {
    /// Scale every slice along `dim` to unit L2 norm.
    ///
    /// `input / max(||input||_2, 1e-12)`
    fn normalize_l2(
        self,
        dim: usize,
    ) -> Self;
}

impl<B: Backend, const D: usize> TensorNormalizeExtension for Tensor<B, D> {
    fn normalize_l2(
        self,
        dim: usize,
    ) -> Self {
        assert!(dim < D, "dim should be less than self.dims().len()");

        let norm = self
            .to_owned()
            .powf_scalar(2.0)
            .sum_dim(dim)
            .sqrt()
            .clamp_min(NORM_EPSILON);
        self.div(norm)
    }
}
