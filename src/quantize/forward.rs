//! Training forward pass.

pub use super::*;

use burn::nn::loss::{MseLoss, Reduction};

/// The output of [`VectorQuantizer::forward`].
#[derive(Clone, Debug)]
pub struct QuantizeOutput<B: Backend> {
    /// The straight-through reconstruction, `[B, C, H, W]`.
    ///
    /// Its value is the quantized feature map,
    /// while its gradient flows to the input unchanged.
    pub reconstruction: Tensor<B, 4>,
    /// The averaged codebook and commitment loss, `[1]`.
    pub loss: Tensor<B, 1>,
    /// Local hit counts summed over the scales, `[V]`.
    ///
    /// It is not reduced among the replicas.
    pub vocab_hit: Tensor<B, 1>,
    /// Hit counts of each scale, `SN` of `[V]`.
    ///
    /// They are summed over the replicas if the collective is initialized.
    pub scale_hits: Vec<Tensor<B, 1>>,
}

impl<B: Backend> VectorQuantizer<B> {
    /// Quantize the feature map for training.
    ///
    /// ## Arguments
    ///
    /// * `input` - The feature map.
    /// * `collective` - It sums the hit counts of each scale among the replicas.
    ///
    /// ## Shapes
    ///
    /// * `input` - `[B, C, H, W]`, where `H == W == side_max`
    ///
    /// ## Details
    ///
    /// For each scale, the loss term is
    /// `beta * mse(f_hat.detach(), input) + mse(f_hat, input.detach())`.
    /// The terms are averaged over the scales.
    ///
    /// The usage statistics are left untouched,
    /// see [`VectorQuantizer::record_usage`].
    pub fn forward<C: Collective<B>>(
        &self,
        input: Tensor<B, 4>,
        collective: &C,
    ) -> Result<QuantizeOutput<B>, Error> {
        if !self.codebook.using_znorm {
            return Err(Error::Unsupported(
                "Training forward pass without z-norm".into(),
            ));
        }
        self.check_feature_map(input.dims(), self.schedule.side_max(), "the input")?;

        let device = input.device();
        let vocab_size = self.vocab_size();
        let input_no_grad = input.to_owned().detach();
        let mse = MseLoss::new();

        let (f_hat, steps) = self.residual_scales(
            input_no_grad.to_owned(),
            &self.schedule,
            self.codebook.lookup_table(),
            None,
            |step| {
                let hit = self.codebook.histogram(step.indices);
                let pending = collective
                    .is_initialized()
                    .then(|| collective.all_reduce_sum(hit.to_owned()));

                let commitment = mse.forward(
                    step.f_hat.to_owned().detach(),
                    input.to_owned(),
                    Reduction::Mean,
                );
                let codebook = mse.forward(
                    step.f_hat.to_owned(),
                    input_no_grad.to_owned(),
                    Reduction::Mean,
                );
                let loss = commitment.mul_scalar(self.beta) + codebook;

                #[cfg(debug_assertions)]
                log::debug!(
                    target: "triplane_vq::quantize::forward",
                    "scale {} (side = {}, pending = {})",
                    step.scale_index,
                    step.side,
                    pending.is_some(),
                );

                let hit_reduced = match pending {
                    Some(pending) => pending.wait()?,
                    None => hit.to_owned(),
                };
                Ok((hit, hit_reduced, loss))
            },
        )?;

        let scale_count = steps.len();
        let mut loss = Tensor::<B, 1>::zeros([1], &device);
        let mut vocab_hit = Tensor::<B, 1>::zeros([vocab_size], &device);
        let mut scale_hits = Vec::with_capacity(scale_count);
        for (hit, hit_reduced, term) in steps {
            loss = loss + term;
            vocab_hit = vocab_hit + hit;
            scale_hits.push(hit_reduced);
        }
        let loss = loss.div_scalar(scale_count as f64);

        // Straight-through estimator
        let reconstruction = (f_hat.detach() - input_no_grad) + input;

        Ok(QuantizeOutput {
            reconstruction,
            loss,
            vocab_hit,
            scale_hits,
        })
    }
}
