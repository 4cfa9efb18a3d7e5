//! Codebook.

pub use super::*;
pub use burn::nn::Embedding;

use burn::nn::{EmbeddingConfig, Initializer};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// The bound of truncated normal initialization, in absolute value.
pub const TRUNCATION_BOUND: f64 = 2.0;

/// The configuration for [`Codebook`].
#[derive(Config, Copy, Debug)]
pub struct CodebookConfig {
    /// Number of code vectors, `V`.
    pub vocab_size: usize,
    /// Dimension of each code vector, `C`.
    pub dim: usize,
    /// Compare against the L2-normalized codes.
    #[config(default = true)]
    pub using_znorm: bool,
}

/// A table of code vectors.
///
/// ## Details
///
/// If [`Self::using_znorm`] is on, every lookup uses the row-normalized view of the table,
/// while the stored table may stay unnormalized until [`Self::renormalize`].
#[derive(Debug, Module)]
pub struct Codebook<B: Backend> {
    /// The stored table, `[V, C]`.
    pub embedding: Embedding<B>,
    /// Compare against the L2-normalized codes.
    pub using_znorm: bool,
}

impl CodebookConfig {
    /// Initialize from the configuration.
    ///
    /// The codes are uniform in `[-1 / V, 1 / V]`, then normalized if using z-norm.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Codebook<B> {
        let bound = 1.0 / self.vocab_size as f64;
        let embedding = EmbeddingConfig::new(self.vocab_size, self.dim)
            .with_initializer(Initializer::Uniform {
                min: -bound,
                max: bound,
            })
            .init(device);
        let codebook = Codebook {
            embedding,
            using_znorm: self.using_znorm,
        };

        if self.using_znorm {
            codebook.renormalize()
        } else {
            codebook
        }
    }
}

impl<B: Backend> Codebook<B> {
    /// Number of code vectors, `V`.
    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.embedding.weight.dims()[0]
    }

    /// Dimension of each code vector, `C`.
    #[inline]
    pub fn dim(&self) -> usize {
        self.embedding.weight.dims()[1]
    }

    #[inline]
    pub fn device(&self) -> B::Device {
        self.embedding.weight.device()
    }

    /// The view of the table used by every lookup.
    ///
    /// The shape is `[V, C]`. It is row-normalized if using z-norm.
    pub fn lookup_table(&self) -> Tensor<B, 2> {
        let table = self.embedding.weight.val();
        if self.using_znorm {
            table.normalize_l2(1)
        } else {
            table
        }
    }

    /// Indices of the nearest codes in `table`.
    ///
    /// ## Shapes
    ///
    /// * `vectors` - `[N, C]`
    /// * `table` - `[V, C]`, from [`Self::lookup_table`]
    /// * `output` - `[N]`
    ///
    /// ## Details
    ///
    /// With z-norm, it maximizes the cosine similarity.
    /// Otherwise, it minimizes the Euclidean distance.
    /// Ties go to the lowest index.
    pub fn nearest(
        &self,
        vectors: Tensor<B, 2>,
        table: Tensor<B, 2>,
    ) -> Tensor<B, 1, Int> {
        let [n, _] = vectors.dims();
        let vectors = vectors.detach();
        let table = table.detach();

        let indices = if self.using_znorm {
            vectors.normalize_l2(1).matmul(table.transpose()).argmax(1)
        } else {
            // ||z||^2 + ||e||^2 - 2 * z * e
            let vectors_norm2 = vectors.to_owned().powf_scalar(2.0).sum_dim(1);
            let table_norm2 = table.to_owned().powf_scalar(2.0).sum_dim(1).transpose();
            let distances = vectors_norm2 + table_norm2
                - vectors.matmul(table.transpose()).mul_scalar(2.0);
            distances.argmin(1)
        };
        indices.reshape([n])
    }

    /// Code vectors of the indices in `table`.
    ///
    /// ## Shapes
    ///
    /// * `table` - `[V, C]`, from [`Self::lookup_table`]
    /// * `indices` - `[N]`
    /// * `output` - `[N, C]`
    #[inline]
    pub fn gather(
        table: Tensor<B, 2>,
        indices: Tensor<B, 1, Int>,
    ) -> Tensor<B, 2> {
        table.select(0, indices)
    }

    /// Hit counts of the indices.
    ///
    /// The shape is `[V]`.
    pub fn histogram(
        &self,
        indices: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        let device = indices.device();
        let [n] = indices.dims();
        Tensor::zeros([self.vocab_size()], &device).scatter(
            0,
            indices,
            Tensor::ones([n], &device),
        )
    }

    /// Normalize the stored table row-wise.
    ///
    /// The table is rebuilt as a new leaf tensor.
    pub fn renormalize(mut self) -> Self {
        let id = self.embedding.weight.id.to_owned();
        let table = self.embedding.weight.val().normalize_l2(1).into_data();
        let table = Tensor::<B, 2>::from_data(table, &self.device());
        self.embedding.weight = Param::initialized(id, table.require_grad());
        self
    }

    /// Re-initialize the stored table.
    ///
    /// ## Details
    ///
    /// * `eini > 0`: normal with standard deviation `eini`,
    ///   truncated to `[-2, 2]`.
    /// * `eini < 0`: uniform in `[-|eini| / V, |eini| / V]`.
    /// * `eini == 0`: unchanged.
    pub fn reinit(
        mut self,
        eini: f64,
        seed: u64,
    ) -> Self {
        let vocab_size = self.vocab_size();
        let dim = self.dim();
        let count = vocab_size * dim;
        let rng = &mut StdRng::seed_from_u64(seed);

        let values = if eini > 0.0 {
            let Ok(normal) = Normal::new(0.0, eini) else {
                return self;
            };
            (0..count)
                .map(|_| loop {
                    let value: f64 = normal.sample(rng);
                    if value.abs() <= TRUNCATION_BOUND {
                        break value as f32;
                    }
                })
                .collect::<Vec<_>>()
        } else if eini < 0.0 {
            let bound = eini.abs() / vocab_size as f64;
            (0..count)
                .map(|_| rng.gen_range(-bound..=bound) as f32)
                .collect::<Vec<_>>()
        } else {
            return self;
        };

        #[cfg(debug_assertions)]
        log::debug!(
            target: "triplane_vq::quantize::codebook",
            "reinit (eini = {eini}, seed = {seed})",
        );

        let id = self.embedding.weight.id.to_owned();
        let table = Tensor::<B, 2>::from_data(
            TensorData::new(values, [vocab_size, dim]).convert::<B::FloatElem>(),
            &self.device(),
        );
        self.embedding.weight = Param::initialized(id, table.require_grad());
        self
    }
}
