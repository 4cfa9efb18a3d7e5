//! Encoding of feature maps into multi-scale indices.

pub use super::*;

/// The outcome of quantizing one scale.
pub(crate) struct ScaleStep<'a, B: Backend> {
    pub scale_index: usize,
    pub side: usize,
    /// `[B * side * side]`
    pub indices: Tensor<B, 1, Int>,
    /// The accumulated reconstruction after this scale.
    pub f_hat: &'a Tensor<B, 4>,
    /// The remaining residual after this scale.
    pub f_rest: &'a Tensor<B, 4>,
}

impl<B: Backend> VectorQuantizer<B> {
    /// Indices of each scale.
    ///
    /// ## Arguments
    ///
    /// * `input` - The feature map.
    /// * `schedule` - It overrides [`Self::schedule`] if given.
    ///   Its last side should equal the side of `input`.
    ///
    /// ## Shapes
    ///
    /// * `input` - `[B, C, H, W]`
    /// * `output` - `SN` of `[B, side^2]`
    ///
    /// ## Details
    ///
    /// It stops after the scale [`Self::progressive_stage`] if given.
    pub fn encode_indices(
        &self,
        input: Tensor<B, 4>,
        schedule: Option<&ScaleSchedule>,
    ) -> Result<Vec<Tensor<B, 2, Int>>, Error> {
        let schedule = self.check_encode_input(&input, schedule)?;
        let batch_size = input.dims()[0];
        let table = self.codebook.lookup_table().detach();

        let (_, indices) = self.residual_scales(
            input.detach(),
            schedule,
            table,
            self.progressive_stage,
            |step| Ok(step.indices.reshape([batch_size, step.side * step.side])),
        )?;

        Ok(indices)
    }

    /// Accumulated reconstructions after each scale.
    ///
    /// ## Shapes
    ///
    /// * `input` - `[B, C, H, W]`
    /// * `output` - `SN` of `[B, C, H, W]`
    ///
    /// ## Details
    ///
    /// It is the counterpart of [`Self::encode_indices`].
    pub fn encode_fhats(
        &self,
        input: Tensor<B, 4>,
        schedule: Option<&ScaleSchedule>,
    ) -> Result<Vec<Tensor<B, 4>>, Error> {
        let schedule = self.check_encode_input(&input, schedule)?;
        let table = self.codebook.lookup_table().detach();

        let (_, f_hats) = self.residual_scales(
            input.detach(),
            schedule,
            table,
            self.progressive_stage,
            |step| Ok(step.f_hat.to_owned()),
        )?;

        Ok(f_hats)
    }

    fn check_encode_input<'a>(
        &'a self,
        input: &Tensor<B, 4>,
        schedule: Option<&'a ScaleSchedule>,
    ) -> Result<&'a ScaleSchedule, Error> {
        let schedule = schedule.unwrap_or(&self.schedule);
        self.check_feature_map(input.dims(), schedule.side_max(), "the input")?;
        Ok(schedule)
    }

    /// Quantize the residual from the coarsest scale to the finest.
    ///
    /// ## Arguments
    ///
    /// * `input` - The feature map, `[B, C, H, H]`, detached.
    /// * `table` - From [`Codebook::lookup_table`].
    ///   The reconstruction carries its gradient.
    ///   Both the search and the gather use it, so every path reconstructs
    ///   from the same codes even if the stored table drifts unnormalized.
    /// * `stage` - The last scale index to quantize.
    /// * `emit` - It receives each scale in order.
    ///
    /// ## Returns
    ///
    /// The final reconstruction and the outputs of `emit`.
    pub(crate) fn residual_scales<T>(
        &self,
        input: Tensor<B, 4>,
        schedule: &ScaleSchedule,
        table: Tensor<B, 2>,
        stage: Option<usize>,
        mut emit: impl FnMut(ScaleStep<'_, B>) -> Result<T, Error>,
    ) -> Result<(Tensor<B, 4>, Vec<T>), Error> {
        let [batch_size, _, height, width] = input.dims();
        let scale_count = schedule.len();

        let mut f_hat = input.zeros_like();
        let mut f_rest = input;
        let mut outputs = Vec::with_capacity(scale_count);

        for (scale_index, &side) in schedule.sides().iter().enumerate() {
            if stage.is_some_and(|stage| stage < scale_index) {
                break;
            }
            let is_final = schedule.is_final(scale_index);

            let rest = if is_final {
                f_rest.to_owned()
            } else {
                f_rest.to_owned().resize_area([side, side])
            };
            let indices = self.codebook.nearest(feature_map_to_vectors(rest), table.to_owned());

            let codes = Codebook::gather(table.to_owned(), indices.to_owned());
            let h = vectors_to_feature_map(codes, [batch_size, side, side]);
            let h = if is_final {
                h
            } else {
                h.resize_bicubic([height, width])
            };
            let h = self.phi.forward(h, scale_index, scale_count);

            f_hat = f_hat + h.to_owned();
            f_rest = f_rest - h.detach();

            outputs.push(emit(ScaleStep {
                scale_index,
                side,
                indices,
                f_hat: &f_hat,
                f_rest: &f_rest,
            })?);
        }

        Ok((f_hat, outputs))
    }
}
