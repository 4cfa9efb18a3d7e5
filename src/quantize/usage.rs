//! Codebook usage statistics.

pub use super::*;

/// The update count before which the EMA blends at [`EMA_RATE_WARMUP`].
pub const EMA_WARMUP_COUNT: usize = 100;

/// The EMA rate of the updates before [`EMA_WARMUP_COUNT`].
pub const EMA_RATE_WARMUP: f64 = 0.1;

/// The EMA rate of the updates after [`EMA_WARMUP_COUNT`].
pub const EMA_RATE_STABLE: f64 = 0.01;

/// The fraction of the expected hit count that a used code should exceed.
pub const USAGE_MARGIN_RATIO: f64 = 0.01;

/// Exponential moving averages of the code hit counts at each scale.
///
/// ## Details
///
/// It is never mutated by the quantization.
/// The caller folds the hit counts of each training pass into a new snapshot
/// with [`UsageStats::updated`].
#[derive(Debug, Module)]
pub struct UsageStats<B: Backend> {
    /// EMA hit counts, `[SN, V]`.
    pub hits: Param<Tensor<B, 2>>,
    /// Number of updated scale rows so far.
    pub record_count: usize,
}

impl<B: Backend> UsageStats<B> {
    /// Zero statistics.
    pub fn init(
        scale_count: usize,
        vocab_size: usize,
        device: &B::Device,
    ) -> Self {
        let hits = Param::initialized(
            ParamId::new(),
            Tensor::zeros([scale_count, vocab_size], device),
        );
        Self {
            hits,
            record_count: 0,
        }
    }

    #[inline]
    pub fn scale_count(&self) -> usize {
        self.hits.dims()[0]
    }

    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.hits.dims()[1]
    }

    /// Fold the hit counts of each scale into a new snapshot.
    ///
    /// ## Shapes
    ///
    /// * `scale_hits` - `SN` of `[V]`
    ///
    /// ## Details
    ///
    /// Each scale row is one update. For the `n`-th update counting from zero:
    /// * `n == 0`: `ema = hit`
    /// * `n < 100`: `ema = 0.9 * ema + 0.1 * hit`
    /// * otherwise: `ema = 0.99 * ema + 0.01 * hit`
    pub fn updated(
        &self,
        scale_hits: &[Tensor<B, 1>],
    ) -> Result<Self, Error> {
        let scale_count = self.scale_count();
        let vocab_size = self.vocab_size();

        if scale_hits.len() > scale_count {
            return Err(Error::Validation(
                format!("The count of scale hits ({})", scale_hits.len()),
                format!("no more than {scale_count}"),
            ));
        }
        if let Some(hit) = scale_hits.iter().find(|hit| hit.dims() != [vocab_size]) {
            return Err(Error::Validation(
                format!("The shape of scale hits {:?}", hit.dims()),
                format!("[{vocab_size}]"),
            ));
        }

        let mut hits = self.hits.val().detach();
        let mut record_count = self.record_count;

        for (scale_index, hit) in scale_hits.iter().enumerate() {
            let range = [scale_index..scale_index + 1, 0..vocab_size];
            let hit = hit.to_owned().detach().reshape([1, vocab_size]);
            let ema = match record_count {
                0 => hit,
                count if count < EMA_WARMUP_COUNT => {
                    Self::blend(hits.to_owned().slice(range.to_owned()), hit, EMA_RATE_WARMUP)
                },
                _ => Self::blend(hits.to_owned().slice(range.to_owned()), hit, EMA_RATE_STABLE),
            };
            hits = hits.slice_assign(range, ema);
            record_count += 1;
        }

        Ok(Self {
            hits: Param::initialized(self.hits.id.to_owned(), hits),
            record_count,
        })
    }

    /// `ema * (1 - rate) + hit * rate`
    #[inline]
    fn blend(
        ema: Tensor<B, 2>,
        hit: Tensor<B, 2>,
        rate: f64,
    ) -> Tensor<B, 2> {
        ema.mul_scalar(1.0 - rate) + hit.mul_scalar(rate)
    }

    /// Percentages of the used codes at each scale.
    ///
    /// ## Details
    ///
    /// A code is used at a scale if its EMA hit count exceeds
    /// `batch_size * side^2 / V * 0.01`.
    pub fn usages(
        &self,
        batch_size: usize,
        schedule: &ScaleSchedule,
    ) -> Vec<f64> {
        let vocab_size = self.vocab_size();
        let hits = self.hits.val().detach();

        schedule
            .sides()
            .iter()
            .enumerate()
            .take(self.scale_count())
            .map(|(scale_index, side)| {
                let margin = (batch_size * side * side) as f64 / vocab_size as f64
                    * USAGE_MARGIN_RATIO;
                hits.to_owned()
                    .slice([scale_index..scale_index + 1, 0..vocab_size])
                    .greater_elem(margin)
                    .float()
                    .mean()
                    .into_scalar()
                    .elem::<f64>()
                    * 100.0
            })
            .collect()
    }
}
