//! Autoregressive inputs and reconstructions from codes.

pub use super::*;

/// The outcome of [`VectorQuantizer::next_autoregressive_input`].
#[derive(Clone, Debug)]
pub enum AutoregressiveStep<B: Backend> {
    /// There are more scales to predict.
    Next {
        /// The accumulated reconstruction, `[B, C, H, W]`.
        f_hat: Tensor<B, 4>,
        /// `f_hat` resampled to the next side, `[B, C, next, next]`.
        next_input: Tensor<B, 4>,
    },
    /// The final scale is reached.
    Final {
        /// The accumulated reconstruction, `[B, C, H, W]`.
        f_hat: Tensor<B, 4>,
    },
}

impl<B: Backend> AutoregressiveStep<B> {
    #[inline]
    pub fn f_hat(&self) -> &Tensor<B, 4> {
        match self {
            Self::Next { f_hat, .. } | Self::Final { f_hat } => f_hat,
        }
    }

    #[inline]
    pub fn next_input(&self) -> Option<&Tensor<B, 4>> {
        match self {
            Self::Next { next_input, .. } => Some(next_input),
            Self::Final { .. } => None,
        }
    }

    #[inline]
    pub fn into_f_hat(self) -> Tensor<B, 4> {
        match self {
            Self::Next { f_hat, .. } | Self::Final { f_hat } => f_hat,
        }
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final { .. })
    }
}

/// The resolution of reconstructions in [`VectorQuantizer::embed_to_fhat`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FhatResolution {
    /// Every reconstruction is at the full resolution.
    #[default]
    MaxScale,
    /// Each reconstruction is at the side of its scale.
    NativeScale,
}

impl<B: Backend> VectorQuantizer<B> {
    /// Teacher-forcing inputs of the next scales from ground-truth indices.
    ///
    /// ## Shapes
    ///
    /// * `indices` - `SN` of `[B, side^2]`, the last one is not used
    /// * `output` - `SN - 1` of `[B, next^2, C]`
    ///
    /// ## Details
    ///
    /// If [`Self::progressive_stage`] is `Some(p)`,
    /// it stops before the scale `p` and outputs nothing when `p == 0`.
    pub fn idx_to_var_input(
        &self,
        indices: &[Tensor<B, 2, Int>],
    ) -> Result<Vec<Tensor<B, 3>>, Error> {
        if !self.codebook.using_znorm {
            return Err(Error::Unsupported(
                "Teacher-forcing inputs without z-norm".into(),
            ));
        }

        let scale_count = self.scale_count();
        let sides = self.schedule.sides();
        let side_max = self.schedule.side_max();
        let dim = self.dim();
        let Some(first) = indices.first() else {
            if scale_count <= 1 {
                return Ok(vec![]);
            }
            return Err(Error::Validation(
                "The count of indices (0)".into(),
                format!("at least {}", scale_count - 1),
            ));
        };
        let batch_size = first.dims()[0];
        let device = first.device();
        let table = self.codebook.lookup_table();

        let mut f_hat = Tensor::<B, 4>::zeros([batch_size, dim, side_max, side_max], &device);
        let mut next_inputs = Vec::with_capacity(scale_count.saturating_sub(1));

        for scale_index in 0..scale_count.saturating_sub(1) {
            if self
                .progressive_stage
                .is_some_and(|stage| stage == 0 || stage - 1 < scale_index)
            {
                break;
            }

            let side = sides[scale_index];
            let index = indices.get(scale_index).ok_or_else(|| {
                Error::Validation(
                    format!("The count of indices ({})", indices.len()),
                    format!("at least {}", scale_count - 1),
                )
            })?;
            if index.dims() != [batch_size, side * side] {
                return Err(Error::Validation(
                    format!("The shape of indices {:?}", index.dims()),
                    format!("[{batch_size}, {}]", side * side),
                ));
            }

            let codes = Codebook::gather(
                table.to_owned(),
                index.to_owned().reshape([batch_size * side * side]),
            );
            let h = vectors_to_feature_map(codes, [batch_size, side, side])
                .resize_bicubic([side_max, side_max]);
            f_hat = f_hat + self.phi.forward(h, scale_index, scale_count);

            let side_next = sides[scale_index + 1];
            let next_input = f_hat
                .to_owned()
                .resize_area([side_next, side_next])
                .reshape([batch_size, dim, side_next * side_next])
                .swap_dims(1, 2);
            next_inputs.push(next_input);
        }

        Ok(next_inputs)
    }

    /// Accumulate the predicted contribution of a scale during generation.
    ///
    /// ## Arguments
    ///
    /// * `scale_index` - The current scale.
    /// * `scale_count` - Scale count of the generation schedule.
    /// * `f_hat` - The accumulated reconstruction, `[B, C, H, W]`.
    /// * `h` - The contribution at the current side, `[B, C, side, side]`.
    ///
    /// ## Details
    ///
    /// The contribution is upsampled to `H` unless it is the final scale,
    /// where it should already be at `H`.
    pub fn next_autoregressive_input(
        &self,
        scale_index: usize,
        scale_count: usize,
        f_hat: Tensor<B, 4>,
        h: Tensor<B, 4>,
    ) -> Result<AutoregressiveStep<B>, Error> {
        if scale_count != self.scale_count() {
            return Err(Error::Validation(
                format!("The scale count ({scale_count})"),
                format!("{}", self.scale_count()),
            ));
        }
        if scale_index >= scale_count {
            return Err(Error::Validation(
                format!("The scale index ({scale_index})"),
                format!("less than {scale_count}"),
            ));
        }

        let side_max = self.schedule.side_max();
        let side = self.schedule.sides()[scale_index];
        self.check_feature_map(f_hat.dims(), side_max, "f_hat")?;
        self.check_feature_map(h.dims(), side, "h")?;

        if self.schedule.is_final(scale_index) {
            let f_hat = f_hat + self.phi.forward(h, scale_index, scale_count);
            return Ok(AutoregressiveStep::Final { f_hat });
        }

        let h = h.resize_bicubic([side_max, side_max]);
        let f_hat = f_hat + self.phi.forward(h, scale_index, scale_count);
        let side_next = self.schedule.sides()[scale_index + 1];
        let next_input = f_hat.to_owned().resize_area([side_next, side_next]);

        Ok(AutoregressiveStep::Next { f_hat, next_input })
    }

    /// Reconstructions after each scale from the contributions.
    ///
    /// ## Shapes
    ///
    /// * `contributions` - `SN` of `[B, C, side, side]`
    /// * `output` - `SN` of `[B, C, H, W]` or `[B, C, side, side]`,
    ///   depending on `resolution`
    ///
    /// ## Details
    ///
    /// With [`FhatResolution::NativeScale`], the reconstruction is upsampled to the next side
    /// before adding the next contribution.
    pub fn embed_to_fhat(
        &self,
        contributions: &[Tensor<B, 4>],
        resolution: FhatResolution,
    ) -> Result<Vec<Tensor<B, 4>>, Error> {
        let scale_count = self.scale_count();
        let sides = self.schedule.sides();
        let side_max = self.schedule.side_max();

        if contributions.len() != scale_count {
            return Err(Error::Validation(
                format!("The count of contributions ({})", contributions.len()),
                format!("{scale_count}"),
            ));
        }
        for (contribution, &side) in contributions.iter().zip(sides) {
            self.check_feature_map(contribution.dims(), side, "the contribution")?;
        }
        let Some(first) = contributions.first() else {
            return Ok(vec![]);
        };
        let [batch_size, dim, ..] = first.dims();
        let device = first.device();

        let mut f_hats = Vec::with_capacity(scale_count);
        match resolution {
            FhatResolution::MaxScale => {
                let mut f_hat =
                    Tensor::<B, 4>::zeros([batch_size, dim, side_max, side_max], &device);
                for (scale_index, h) in contributions.iter().enumerate() {
                    let h = h.to_owned().resize_bicubic([side_max, side_max]);
                    f_hat = f_hat + self.phi.forward(h, scale_index, scale_count);
                    f_hats.push(f_hat.to_owned());
                }
            },
            FhatResolution::NativeScale => {
                let side = sides[0];
                let mut f_hat = Tensor::<B, 4>::zeros([batch_size, dim, side, side], &device);
                for (scale_index, (h, &side)) in contributions.iter().zip(sides).enumerate() {
                    f_hat = f_hat.resize_bicubic([side, side])
                        + self.phi.forward(h.to_owned(), scale_index, scale_count);
                    f_hats.push(f_hat.to_owned());
                }
            },
        }

        Ok(f_hats)
    }

    /// The final reconstruction from the contributions.
    ///
    /// See [`Self::embed_to_fhat`].
    pub fn embed_to_fhat_last(
        &self,
        contributions: &[Tensor<B, 4>],
    ) -> Result<Tensor<B, 4>, Error> {
        self.embed_to_fhat(contributions, FhatResolution::MaxScale)?
            .pop()
            .ok_or_else(|| {
                Error::Validation("The count of contributions (0)".into(), "at least 1".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantize::tests::feature_map;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    /// Contributions of each scale at its side from the indices.
    fn contributions(
        quantizer: &VectorQuantizer<B>,
        indices: &[Tensor<B, 2, Int>],
    ) -> Vec<Tensor<B, 4>> {
        let table = quantizer.codebook.lookup_table();
        indices
            .iter()
            .zip(quantizer.schedule.sides())
            .map(|(index, &side)| {
                let batch_size = index.dims()[0];
                let codes = Codebook::gather(
                    table.to_owned(),
                    index.to_owned().reshape([batch_size * side * side]),
                );
                vectors_to_feature_map(codes, [batch_size, side, side])
            })
            .collect()
    }

    #[test]
    fn var_input_identity_phi() {
        let device = &Default::default();

        let quantizer = VectorQuantizerConfig::new(5, 3)
            .with_patch_nums(vec![1, 2])
            .with_quant_resi(0.0)
            .init::<B>(device)
            .unwrap();
        let indices = [
            Tensor::<B, 2, Int>::from_ints([[2]], device),
            Tensor::<B, 2, Int>::from_ints([[0, 1, 3, 4]], device),
        ];

        let next_inputs = quantizer.idx_to_var_input(&indices).unwrap();
        assert_eq!(next_inputs.len(), 1);
        assert_eq!(next_inputs[0].dims(), [1, 4, 3]);

        let code = quantizer.codebook.lookup_table().slice([2..3, 0..3]);
        let target = Tensor::cat(vec![code; 4], 0).reshape([1, 4, 3]);
        next_inputs[0]
            .to_owned()
            .into_data()
            .assert_approx_eq_diff(&target.into_data(), 1e-5);
    }

    #[test]
    fn var_input_blended_phi() {
        let device = &Default::default();

        let quantizer = VectorQuantizerConfig::new(5, 3)
            .with_patch_nums(vec![1, 2])
            .with_quant_resi(0.5)
            .init::<B>(device)
            .unwrap();
        assert!(!quantizer.phi.select(0, 2).is_identity());
        let indices = [
            Tensor::<B, 2, Int>::from_ints([[3]], device),
            Tensor::<B, 2, Int>::from_ints([[0, 1, 3, 4]], device),
        ];

        let next_inputs = quantizer.idx_to_var_input(&indices).unwrap();
        assert_eq!(next_inputs.len(), 1);

        let codes = Codebook::gather(
            quantizer.codebook.lookup_table(),
            Tensor::<B, 1, Int>::from_ints([3], device),
        );
        let h = vectors_to_feature_map(codes, [1, 1, 1]).resize_bicubic([2, 2]);
        let f_hat = Tensor::<B, 4>::zeros([1, 3, 2, 2], device)
            + quantizer.phi.select(0, 2).forward(h);
        let target = f_hat
            .resize_area([2, 2])
            .reshape([1, 3, 4])
            .swap_dims(1, 2);

        next_inputs[0]
            .to_owned()
            .into_data()
            .assert_eq(&target.into_data(), true);
    }

    #[test]
    fn var_input_matches_encode() {
        let device = &Default::default();

        let quantizer = VectorQuantizerConfig::new(16, 3)
            .with_patch_nums(vec![1, 2, 3, 4])
            .init::<B>(device)
            .unwrap();
        let input = feature_map::<B>([2, 3, 4, 4], 31, device);

        let indices = quantizer.encode_indices(input.to_owned(), None).unwrap();
        let f_hats = quantizer.encode_fhats(input, None).unwrap();
        let next_inputs = quantizer.idx_to_var_input(&indices).unwrap();
        assert_eq!(next_inputs.len(), 3);

        next_inputs
            .into_iter()
            .zip(f_hats)
            .zip(&quantizer.schedule.sides()[1..])
            .for_each(|((next_input, f_hat), &side)| {
                let target = f_hat
                    .resize_area([side, side])
                    .reshape([2, 3, side * side])
                    .swap_dims(1, 2);
                assert_eq!(next_input.dims(), [2, side * side, 3]);
                next_input
                    .into_data()
                    .assert_approx_eq_diff(&target.into_data(), 1e-5);
            });
    }

    #[test]
    fn var_input_progressive_and_invalid() {
        let device = &Default::default();

        let mut quantizer = VectorQuantizerConfig::new(16, 3)
            .with_patch_nums(vec![1, 2, 4])
            .init::<B>(device)
            .unwrap();
        let input = feature_map::<B>([1, 3, 4, 4], 32, device);
        let indices = quantizer.encode_indices(input, None).unwrap();

        quantizer.progressive_stage = Some(0);
        assert!(quantizer.idx_to_var_input(&indices).unwrap().is_empty());
        quantizer.progressive_stage = Some(1);
        assert_eq!(quantizer.idx_to_var_input(&indices).unwrap().len(), 1);
        quantizer.progressive_stage = None;
        assert_eq!(quantizer.idx_to_var_input(&indices).unwrap().len(), 2);

        assert!(matches!(
            quantizer.idx_to_var_input(&indices[..1]),
            Err(Error::Validation(..))
        ));
        assert!(matches!(
            quantizer.idx_to_var_input(&[indices[1].to_owned(), indices[0].to_owned()]),
            Err(Error::Validation(..))
        ));

        let quantizer = VectorQuantizerConfig::new(16, 3)
            .with_patch_nums(vec![1, 2, 4])
            .with_using_znorm(false)
            .init::<B>(device)
            .unwrap();
        assert!(matches!(
            quantizer.idx_to_var_input(&indices),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn autoregressive_matches_encode() {
        let device = &Default::default();

        let quantizer = VectorQuantizerConfig::new(16, 3)
            .with_patch_nums(vec![1, 2, 4])
            .init::<B>(device)
            .unwrap();
        let input = feature_map::<B>([1, 3, 4, 4], 33, device);
        let indices = quantizer.encode_indices(input.to_owned(), None).unwrap();
        let f_hats = quantizer.encode_fhats(input, None).unwrap();
        let contributions = contributions(&quantizer, &indices);

        let mut f_hat = Tensor::<B, 4>::zeros([1, 3, 4, 4], device);
        for (scale_index, h) in contributions.into_iter().enumerate() {
            let step = quantizer
                .next_autoregressive_input(scale_index, 3, f_hat, h)
                .unwrap();
            step.f_hat().to_owned().into_data().assert_approx_eq_diff(
                &f_hats[scale_index].to_owned().into_data(),
                1e-5,
            );
            match &step {
                AutoregressiveStep::Next { next_input, .. } => {
                    let side = quantizer.schedule.sides()[scale_index + 1];
                    assert_eq!(next_input.dims(), [1, 3, side, side]);
                },
                AutoregressiveStep::Final { .. } => assert_eq!(scale_index, 2),
            }
            assert_eq!(step.is_final(), scale_index == 2);
            assert_eq!(step.next_input().is_none(), scale_index == 2);
            f_hat = step.into_f_hat();
        }
    }

    #[test]
    fn autoregressive_invalid() {
        let device = &Default::default();

        let quantizer = VectorQuantizerConfig::new(16, 3)
            .with_patch_nums(vec![1, 2, 4])
            .init::<B>(device)
            .unwrap();
        let f_hat = Tensor::<B, 4>::zeros([1, 3, 4, 4], device);
        let h = Tensor::<B, 4>::zeros([1, 3, 2, 2], device);

        assert!(quantizer
            .next_autoregressive_input(1, 3, f_hat.to_owned(), h.to_owned())
            .is_ok());
        assert!(matches!(
            quantizer.next_autoregressive_input(3, 3, f_hat.to_owned(), h.to_owned()),
            Err(Error::Validation(..))
        ));
        assert!(matches!(
            quantizer.next_autoregressive_input(1, 4, f_hat.to_owned(), h.to_owned()),
            Err(Error::Validation(..))
        ));
        assert!(matches!(
            quantizer.next_autoregressive_input(0, 3, f_hat, h),
            Err(Error::Validation(..))
        ));
    }

    #[test]
    fn embed_to_fhat_resolutions() {
        let device = &Default::default();

        let quantizer = VectorQuantizerConfig::new(16, 3)
            .with_patch_nums(vec![1, 2, 4])
            .init::<B>(device)
            .unwrap();
        let input = feature_map::<B>([2, 3, 4, 4], 34, device);
        let indices = quantizer.encode_indices(input.to_owned(), None).unwrap();
        let f_hats = quantizer.encode_fhats(input, None).unwrap();
        let contributions = contributions(&quantizer, &indices);

        let outputs = quantizer
            .embed_to_fhat(&contributions, FhatResolution::MaxScale)
            .unwrap();
        assert_eq!(outputs.len(), 3);
        outputs.into_iter().zip(f_hats.to_owned()).for_each(|(output, f_hat)| {
            output
                .into_data()
                .assert_approx_eq_diff(&f_hat.into_data(), 1e-5);
        });

        let last = quantizer.embed_to_fhat_last(&contributions).unwrap();
        last.into_data()
            .assert_approx_eq_diff(&f_hats[2].to_owned().into_data(), 1e-5);

        let outputs = quantizer
            .embed_to_fhat(&contributions, FhatResolution::NativeScale)
            .unwrap();
        let dims = outputs.iter().map(|output| output.dims()).collect::<Vec<_>>();
        assert_eq!(dims, [[2, 3, 1, 1], [2, 3, 2, 2], [2, 3, 4, 4]]);

        assert!(matches!(
            quantizer.embed_to_fhat(&contributions[..2], FhatResolution::MaxScale),
            Err(Error::Validation(..))
        ));
    }
}
