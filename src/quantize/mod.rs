//! Multi-scale residual vector quantization.
//!
//! A continuous feature map is quantized from the coarsest scale to the finest.
//! Each scale snaps the downsampled residual to the nearest codes,
//! upsamples and smooths them, then adds them to the reconstruction
//! and subtracts them from the residual.

pub mod autoregress;
pub mod codebook;
pub mod collective;
pub mod encode;
pub mod forward;
pub mod phi;
pub mod schedule;
pub mod usage;

pub use crate::{
    error::Error,
    function::{
        feature_map_to_vectors, vectors_to_feature_map, TensorNormalizeExtension,
        TensorResampleExtension,
    },
};
pub use autoregress::{AutoregressiveStep, FhatResolution};
pub use burn::{
    config::Config,
    module::{Module, Param, ParamId},
    tensor::{backend::Backend, ElementConversion, Int, Tensor, TensorData},
};
pub use codebook::{Codebook, CodebookConfig};
pub use collective::{Collective, LocalCollective, PendingReduce, ThreadGroup};
pub use forward::QuantizeOutput;
pub use phi::{Phi, PhiBank, PhiBankConfig, PhiConfig, PhiSharing};
pub use schedule::ScaleSchedule;
pub use usage::UsageStats;

use humansize::{format_size, BINARY};
use std::fmt;

/// The configuration for [`VectorQuantizer`].
#[derive(Config, Debug)]
pub struct VectorQuantizerConfig {
    /// Number of code vectors, `V`.
    pub vocab_size: usize,
    /// Channel count of the feature map, `C`.
    pub dim: usize,
    /// Sides of the scale schedule from small to large.
    #[config(default = "vec![1, 2, 3, 4, 5, 6, 8, 10, 13, 16]")]
    pub patch_nums: Vec<usize>,
    /// Compare against the L2-normalized codes.
    ///
    /// Training and teacher-forcing only support z-norm.
    #[config(default = true)]
    pub using_znorm: bool,
    /// Weight of the commitment loss.
    #[config(default = 0.25)]
    pub beta: f64,
    /// Mixing ratio of [`Phi`].
    #[config(default = 0.5)]
    pub quant_resi: f64,
    /// Sharing count of [`PhiBank`], see [`PhiSharing::from`].
    #[config(default = 4)]
    pub share_quant_resi: usize,
    /// Transform count of an independent [`PhiBank`],
    /// see [`PhiBankConfig::independent_count`].
    pub independent_count: Option<usize>,
    /// The last scale index to quantize in progressive training.
    ///
    /// All scales are quantized if it is `None`.
    pub progressive_stage: Option<usize>,
}

/// Multi-scale residual vector quantizer.
#[derive(Module)]
pub struct VectorQuantizer<B: Backend> {
    /// Code vectors.
    pub codebook: Codebook<B>,
    /// Residual smoothing of each scale.
    pub phi: PhiBank<B>,
    /// EMA usage statistics of the codes.
    pub usage: UsageStats<B>,
    /// Scales from small to large.
    pub schedule: ScaleSchedule,
    /// Weight of the commitment loss.
    pub beta: f64,
    /// The last scale index to quantize in progressive training.
    pub progressive_stage: Option<usize>,
}

impl VectorQuantizerConfig {
    /// Initialize from the configuration.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<VectorQuantizer<B>, Error> {
        let schedule = ScaleSchedule::new(self.patch_nums.to_owned())?;
        let codebook = CodebookConfig::new(self.vocab_size, self.dim)
            .with_using_znorm(self.using_znorm)
            .init(device);
        let phi = PhiBankConfig {
            phi: PhiConfig::new(self.dim).with_quant_resi(self.quant_resi),
            scale_count: schedule.len(),
            share_quant_resi: self.share_quant_resi,
            independent_count: self.independent_count,
        }
        .init(device);
        let usage = UsageStats::init(schedule.len(), self.vocab_size, device);

        log::info!(
            target: "triplane_vq::quantize",
            "init (schedule = {schedule}, V = {}, C = {}, znorm = {}, phi = {:?})",
            self.vocab_size,
            self.dim,
            self.using_znorm,
            phi.sharing(),
        );

        Ok(VectorQuantizer {
            codebook,
            phi,
            usage,
            schedule,
            beta: self.beta,
            progressive_stage: self.progressive_stage,
        })
    }
}

impl<B: Backend> VectorQuantizer<B> {
    /// Number of scales, `SN`.
    #[inline]
    pub fn scale_count(&self) -> usize {
        self.schedule.len()
    }

    /// Number of code vectors, `V`.
    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.codebook.vocab_size()
    }

    /// Channel count of the feature map, `C`.
    #[inline]
    pub fn dim(&self) -> usize {
        self.codebook.dim()
    }

    #[inline]
    pub fn device(&self) -> B::Device {
        self.codebook.device()
    }

    /// Size of the parameters in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.num_params() * size_of::<B::FloatElem>()
    }

    /// Readable size of the parameters.
    #[inline]
    pub fn size_readable(&self) -> String {
        format_size(self.size(), BINARY.decimal_places(1))
    }

    /// Percentages of the used codes at each scale.
    ///
    /// See [`UsageStats::usages`].
    #[inline]
    pub fn usages(
        &self,
        batch_size: usize,
    ) -> Vec<f64> {
        self.usage.usages(batch_size, &self.schedule)
    }

    /// Fold the reduced hit counts of a training pass into the usage statistics.
    ///
    /// See [`UsageStats::updated`].
    pub fn record_usage(
        mut self,
        scale_hits: &[Tensor<B, 1>],
    ) -> Result<Self, Error> {
        self.usage = self.usage.updated(scale_hits)?;
        Ok(self)
    }

    /// Re-initialize the codes, see [`Codebook::reinit`].
    pub fn reinit_codebook(
        mut self,
        eini: f64,
        seed: u64,
    ) -> Self {
        self.codebook = self.codebook.reinit(eini, seed);
        self
    }

    /// Check the shape `[B, C, side, side]` of a feature map.
    pub(crate) fn check_feature_map(
        &self,
        dims: [usize; 4],
        side: usize,
        name: &str,
    ) -> Result<(), Error> {
        let [batch_size, channels, height, width] = dims;
        let dim = self.dim();
        if channels != dim || height != side || width != side {
            return Err(Error::Validation(
                format!("The shape of {name} {dims:?}"),
                format!("[{batch_size}, {dim}, {side}, {side}]"),
            ));
        }
        Ok(())
    }
}

impl<B: Backend> fmt::Debug for VectorQuantizer<B> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct(&format!("VectorQuantizer<{}>", B::name()))
            .field("device", &self.device())
            .field("size", &self.size_readable())
            .field("schedule", &self.schedule.to_string())
            .field("vocab_size", &self.vocab_size())
            .field("dim", &self.dim())
            .field("using_znorm", &self.codebook.using_znorm)
            .field("beta", &self.beta)
            .field("phi.sharing()", &self.phi.sharing())
            .field("phi.ticks", &self.phi.ticks)
            .field("usage.record_count", &self.usage.record_count)
            .field("progressive_stage", &self.progressive_stage)
            .finish()
    }
}
