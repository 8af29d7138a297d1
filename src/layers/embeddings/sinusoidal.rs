use candle_core::{Device, Tensor};
use snafu::{ensure, ResultExt, Snafu};

/// Errors for sinusoidal embeddings.
#[derive(Debug, Snafu)]
pub enum SinusoidalEmbeddingsError {
    #[snafu(display("Cannot build sinusoidal position table"))]
    BuildTable { source: candle_core::Error },

    #[snafu(display("Cannot derive sin/cos frequency tables"))]
    FrequencyTables { source: candle_core::Error },

    #[snafu(display("Embedding width must be even, was {width}"))]
    WidthNotEven { width: usize },
}

/// Sinusoidal positional embeddings (Vaswani et al., 2017).
///
/// Fixed embeddings built from sine/cosine pairs at geometrically spaced
/// frequencies: even channels hold the sine, odd channels the cosine of
/// the angle `position / base^(i / width)`. Besides the additive position
/// table, this module exposes per-pair duplicated sin/cos tables in the
/// layout consumed by interleaved rotary embeddings.
#[derive(Debug)]
pub struct SinusoidalEmbeddings {
    pos_emb: Tensor,
    sin_freqs: Tensor,
    cos_freqs: Tensor,
}

impl SinusoidalEmbeddings {
    /// Base used for the angle when none is given.
    pub const DEFAULT_BASE: f32 = 10_000.0;

    /// Precompute sinusoidal embeddings for up to `max_len` positions.
    ///
    /// * `width` - Embedding width. Must be even.
    /// * `max_len` - Number of positions to precompute.
    /// * `base` - The base used for the angle (normally 10_000). Determines
    ///   the cycle length of the embeddings.
    /// * `device` - Device on which the tables are to be allocated.
    pub fn new(
        width: usize,
        max_len: usize,
        base: f32,
        device: &Device,
    ) -> Result<Self, SinusoidalEmbeddingsError> {
        ensure!(width % 2 == 0, WidthNotEvenSnafu { width });

        // Θ_i = base^(-2(i-1)/d), one angle per channel pair.
        let inv_freq: Vec<_> = (0..width)
            .step_by(2)
            .map(|i| base.powf(-(i as f32 / width as f32)))
            .collect();
        let inv_freq =
            Tensor::from_vec(inv_freq, (1, width / 2), device).context(BuildTableSnafu)?;

        // mΘ
        let position = Tensor::arange(0.0, max_len as f32, device)
            .and_then(|xs| xs.unsqueeze(1))
            .context(BuildTableSnafu)?;
        let m_theta = position.broadcast_mul(&inv_freq).context(BuildTableSnafu)?;
        let sin = m_theta.sin().context(BuildTableSnafu)?;
        let cos = m_theta.cos().context(BuildTableSnafu)?;

        // Interleave so that even channels are sines, odd channels cosines.
        let pos_emb = Tensor::stack(&[&sin, &cos], 2)
            .and_then(|xs| xs.reshape((1, max_len, width)))
            .context(BuildTableSnafu)?;

        let sin_freqs = Self::duplicate_pairs(&sin, max_len, width).context(FrequencyTablesSnafu)?;
        let cos_freqs = Self::duplicate_pairs(&cos, max_len, width).context(FrequencyTablesSnafu)?;

        Ok(SinusoidalEmbeddings {
            pos_emb,
            sin_freqs,
            cos_freqs,
        })
    }

    /// Repeat every angle across its channel pair, so that the rotation
    /// can be applied elementwise against a full-width tensor.
    fn duplicate_pairs(
        half: &Tensor,
        max_len: usize,
        width: usize,
    ) -> Result<Tensor, candle_core::Error> {
        Tensor::stack(&[half, half], 2)?.reshape((1, max_len, 1, width))
    }

    /// Position embedding table, for additive positional encoding.
    ///
    /// *Shape:* `(1, max_len, width)`
    pub fn embeddings(&self) -> &Tensor {
        &self.pos_emb
    }

    /// Sine frequency table, each angle duplicated across its channel pair.
    ///
    /// *Shape:* `(1, max_len, 1, width)`
    pub fn sin_freqs(&self) -> &Tensor {
        &self.sin_freqs
    }

    /// Cosine frequency table, each angle duplicated across its channel pair.
    ///
    /// *Shape:* `(1, max_len, 1, width)`
    pub fn cos_freqs(&self) -> &Tensor {
        &self.cos_freqs
    }
}
