//! Residual smoothing.

pub use super::*;
pub use burn::nn::conv::Conv2d;

use burn::nn::{conv::Conv2dConfig, PaddingConfig2d};

/// The ratio at or below which [`Phi`] is the identity.
pub const PHI_RATIO_MIN: f64 = 1e-6;

/// The configuration for [`Phi`].
#[derive(Config, Copy, Debug)]
pub struct PhiConfig {
    /// Channel count of the feature map.
    pub channels: usize,
    /// Mixing ratio of the local context.
    ///
    /// Only its magnitude is used.
    #[config(default = 0.5)]
    pub quant_resi: f64,
}

/// Residual smoothing with local context of 3x3 neighborhood.
///
/// `input * (1 - ratio) + conv_3x3(input) * ratio`
///
/// ## Details
///
/// It is the identity if the ratio is no more than [`PHI_RATIO_MIN`].
#[derive(Debug, Module)]
pub struct Phi<B: Backend> {
    /// Convolution with same padding.
    pub conv: Option<Conv2d<B>>,
    /// Mixing ratio of the convolution.
    pub ratio: f64,
}

/// The way the smoothing transforms are shared among the scales.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PhiSharing {
    /// One transform for each scale.
    Independent,
    /// One transform for all scales.
    Shared,
    /// `K` transforms selected by the nearest tick of scale position.
    PartiallyShared(usize),
}

/// The configuration for [`PhiBank`].
#[derive(Config, Copy, Debug)]
pub struct PhiBankConfig {
    /// Configuration of each transform.
    pub phi: PhiConfig,
    /// Scale count of the schedule.
    pub scale_count: usize,
    /// Sharing count, see [`PhiSharing::from`].
    #[config(default = 4)]
    pub share_quant_resi: usize,
    /// Transform count of an independent bank.
    ///
    /// It is the scale count if it is `None` or `Some(0)`.
    /// Other counts select the transforms by the nearest tick.
    pub independent_count: Option<usize>,
}

/// Smoothing transforms selectable by scale.
#[derive(Debug, Module)]
pub struct PhiBank<B: Backend> {
    /// Transforms.
    pub transforms: Vec<Phi<B>>,
    /// Positions in `(0, 1)` of the transforms.
    ///
    /// It is empty if the transform is shared.
    pub ticks: Vec<f64>,
    /// Sharing count, see [`PhiSharing::from`].
    pub share_count: usize,
}

impl PhiConfig {
    /// Initialize from the configuration.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Phi<B> {
        let ratio = self.quant_resi.abs();
        let conv = (ratio > PHI_RATIO_MIN).then(|| {
            Conv2dConfig::new([self.channels, self.channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        });
        Phi { conv, ratio }
    }
}

impl<B: Backend> Phi<B> {
    /// Applies the smoothing on the feature map.
    ///
    /// ## Shapes
    ///
    /// * `input` - `[B, C, H, W]`
    /// * `output` - `[B, C, H, W]`
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        match &self.conv {
            Some(conv) => {
                let context = conv.forward(input.to_owned()).mul_scalar(self.ratio);
                input.mul_scalar(1.0 - self.ratio) + context
            },
            None => input,
        }
    }

    #[inline]
    pub fn is_identity(&self) -> bool {
        self.conv.is_none()
    }
}

impl From<usize> for PhiSharing {
    /// `0` is independent, `1` is shared and `K` is partially shared.
    #[inline]
    fn from(share_count: usize) -> Self {
        match share_count {
            0 => Self::Independent,
            1 => Self::Shared,
            count => Self::PartiallyShared(count),
        }
    }
}

impl From<PhiSharing> for usize {
    #[inline]
    fn from(sharing: PhiSharing) -> Self {
        match sharing {
            PhiSharing::Independent => 0,
            PhiSharing::Shared => 1,
            PhiSharing::PartiallyShared(count) => count,
        }
    }
}

impl PhiSharing {
    /// Number of transforms for a schedule of `scale_count` scales.
    #[inline]
    pub fn transform_count(
        self,
        scale_count: usize,
    ) -> usize {
        match self {
            Self::Independent => scale_count.max(1),
            Self::Shared => 1,
            Self::PartiallyShared(count) => count,
        }
    }
}

impl PhiBankConfig {
    /// Initialize from the configuration.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> PhiBank<B> {
        let sharing = PhiSharing::from(self.share_quant_resi);
        let count = match (sharing, self.independent_count) {
            (PhiSharing::Independent, Some(count)) if count > 0 => count,
            _ => sharing.transform_count(self.scale_count),
        };
        let transforms = (0..count).map(|_| self.phi.init(device)).collect();
        let ticks = match sharing {
            PhiSharing::Shared => vec![],
            _ => PhiBank::<B>::make_ticks(count),
        };

        PhiBank {
            transforms,
            ticks,
            share_count: self.share_quant_resi,
        }
    }
}

impl<B: Backend> PhiBank<B> {
    /// Evenly spaced positions of `count` transforms.
    ///
    /// `linspace(1 / 3K, 1 - 1 / 3K, K)` if `K == 4`,
    /// otherwise `linspace(1 / 2K, 1 - 1 / 2K, K)`.
    pub fn make_ticks(count: usize) -> Vec<f64> {
        let k = count as f64;
        let margin = if count == 4 { 1.0 / 3.0 / k } else { 1.0 / 2.0 / k };
        match count {
            0 => vec![],
            1 => vec![margin],
            _ => {
                let step = (1.0 - 2.0 * margin) / (k - 1.0);
                (0..count).map(|i| margin + step * i as f64).collect()
            },
        }
    }

    #[inline]
    pub fn sharing(&self) -> PhiSharing {
        PhiSharing::from(self.share_count)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Index of the tick nearest to `position`.
    ///
    /// Ties go to the lowest index.
    pub fn nearest_tick(
        &self,
        position: f64,
    ) -> usize {
        self.ticks
            .iter()
            .enumerate()
            .fold((0, f64::INFINITY), |(index_min, distance_min), (index, tick)| {
                let distance = (tick - position).abs();
                if distance < distance_min {
                    (index, distance)
                } else {
                    (index_min, distance_min)
                }
            })
            .0
    }

    /// Select the transform for the scale.
    ///
    /// ## Details
    ///
    /// Independent transforms are indexed by `scale_index` directly
    /// when `scale_count` matches their count.
    pub fn select(
        &self,
        scale_index: usize,
        scale_count: usize,
    ) -> &Phi<B> {
        let index = match self.sharing() {
            PhiSharing::Shared => 0,
            PhiSharing::Independent if scale_count == self.len() => scale_index,
            _ => self.nearest_tick(ScaleSchedule::position(scale_index, scale_count)),
        };
        &self.transforms[index]
    }

    /// Applies the transform of the scale on the feature map.
    #[inline]
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
        scale_index: usize,
        scale_count: usize,
    ) -> Tensor<B, 4> {
        self.select(scale_index, scale_count).forward(input)
    }
}
