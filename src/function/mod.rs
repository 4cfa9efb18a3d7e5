//! Tensor functions shared by the quantizer.

pub mod normalize;
pub mod resample;

pub use burn::tensor::{backend::Backend, Int, Tensor};
pub use normalize::TensorNormalizeExtension;
pub use resample::{
    feature_map_to_vectors, vectors_to_feature_map, TensorResampleExtension,
};
