use candle_core::{Device, IndexOp, Tensor};
use snafu::{ensure, ResultExt, Snafu};

use crate::layers::embeddings::{SinusoidalEmbeddings, SinusoidalEmbeddingsError};

/// Errors for interleaved rotary embeddings.
#[derive(Debug, Snafu)]
pub enum InterleavedRotaryEmbeddingsError {
    #[snafu(display("Cannot apply rotary embeddings to input"))]
    ApplyEmbeddings { source: candle_core::Error },

    #[snafu(display("Cannot build frequency tables"))]
    FrequencyTables { source: SinusoidalEmbeddingsError },

    #[snafu(display("Invalid input rank, expected {expected}, got {got}"))]
    InvalidRank {
        expected: usize,
        got: usize,
        source: candle_core::Error,
    },

    #[snafu(display("Cannot rotate input tensor"))]
    Rotate { source: candle_core::Error },

    #[snafu(display("Query and key sequence lengths differ, {query_seq_len} vs {key_seq_len}"))]
    SequenceMismatch {
        query_seq_len: usize,
        key_seq_len: usize,
    },

    #[snafu(display("Sequence length {seq_len} exceeds precomputed length {max_len}"))]
    SequenceTooLong { seq_len: usize, max_len: usize },

    #[snafu(display("Cannot slice frequency tables"))]
    SliceTables { source: candle_core::Error },

    #[snafu(display("Invalid head width, expected {expected}, got {got}"))]
    WidthMismatch { expected: usize, got: usize },
}

/// Rotary embeddings (Su et al., 2021), interleaved-pair convention.
///
/// Paper: https://arxiv.org/abs/2104.09864
///
/// Each adjacent channel pair `(2j, 2j+1)` of the query and key vectors is
/// rotated by an angle proportional to its position, so that attention dot
/// products encode relative position. The frequency tables are expanded to
/// full width with every angle duplicated across its pair, and the rotation
/// is applied elementwise as `x * cos + rotate(x) * sin`.
///
/// `SplitRotaryEmbeddings` implements the same rotation with half-width
/// tables and an explicit complex split.
#[derive(Debug)]
pub struct InterleavedRotaryEmbeddings {
    sin_freqs: Tensor,
    cos_freqs: Tensor,
    max_len: usize,
    width: usize,
}

impl InterleavedRotaryEmbeddings {
    /// Construct an interleaved rotary embedding module.
    ///
    /// The frequency tables are precomputed for up to `max_len` positions
    /// and never resized; longer inputs are rejected at apply time.
    ///
    /// * `width` - Attention head width. Must be even.
    /// * `max_len` - Number of positions to precompute.
    /// * `base` - The base used for the angle (normally 10_000). Determines
    ///   the cycle length of the embeddings.
    /// * `device` - Device on which the module is to be initialized.
    pub fn new(
        width: usize,
        max_len: usize,
        base: f32,
        device: &Device,
    ) -> Result<Self, InterleavedRotaryEmbeddingsError> {
        let embeddings = SinusoidalEmbeddings::new(width, max_len, base, device)
            .context(FrequencyTablesSnafu)?;

        Ok(InterleavedRotaryEmbeddings {
            sin_freqs: embeddings.sin_freqs().clone(),
            cos_freqs: embeddings.cos_freqs().clone(),
            max_len,
            width,
        })
    }

    /// Map each channel pair `(x[2j], x[2j+1])` to `(-x[2j+1], x[2j])`,
    /// a 90° rotation within every pair.
    fn rotate_alternate(input: &Tensor) -> Result<Tensor, InterleavedRotaryEmbeddingsError> {
        let (batch_size, seq_len, n_heads, width) =
            input.shape().dims4().context(RotateSnafu)?;
        let pairs = input
            .reshape((batch_size, seq_len, n_heads, width / 2, 2))
            .context(RotateSnafu)?;
        let even = pairs.narrow(4, 0, 1).context(RotateSnafu)?;
        let odd = pairs.narrow(4, 1, 1).context(RotateSnafu)?;
        Tensor::cat(&[&odd.neg().context(RotateSnafu)?, &even], 4)
            .and_then(|xs| xs.reshape((batch_size, seq_len, n_heads, width)))
            .context(RotateSnafu)
    }

    fn rotate(
        input: &Tensor,
        sin: &Tensor,
        cos: &Tensor,
    ) -> Result<Tensor, InterleavedRotaryEmbeddingsError> {
        let input_cos = input.broadcast_mul(cos).context(ApplyEmbeddingsSnafu)?;
        let input_sin = Self::rotate_alternate(input)?
            .broadcast_mul(sin)
            .context(ApplyEmbeddingsSnafu)?;
        (input_cos + input_sin).context(ApplyEmbeddingsSnafu)
    }

    /// Apply rotary embeddings to the query and key.
    ///
    /// Positions are `[0, seq_len)`.
    ///
    /// * `query` - Query to apply the rotary embeddings to.
    ///   *Shape:* `(batch_size, seq_len, n_heads, width)`
    /// * `key` - Key to apply the rotary embeddings to.
    ///   *Shape:* `(batch_size, seq_len, n_heads, width)`
    ///
    /// Returns: query and key with the rotary embeddings applied.
    /// *Shape:* `(batch_size, seq_len, n_heads, width)`
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
    ) -> Result<(Tensor, Tensor), InterleavedRotaryEmbeddingsError> {
        let (_batch_size, seq_len, _n_heads, width) =
            query.shape().dims4().context(InvalidRankSnafu {
                expected: 4usize,
                got: query.rank(),
            })?;
        let (_, key_seq_len, _, key_width) = key.shape().dims4().context(InvalidRankSnafu {
            expected: 4usize,
            got: key.rank(),
        })?;

        ensure!(
            width == self.width,
            WidthMismatchSnafu {
                expected: self.width,
                got: width,
            }
        );
        ensure!(
            key_width == self.width,
            WidthMismatchSnafu {
                expected: self.width,
                got: key_width,
            }
        );
        ensure!(
            key_seq_len == seq_len,
            SequenceMismatchSnafu {
                query_seq_len: seq_len,
                key_seq_len,
            }
        );
        ensure!(
            seq_len <= self.max_len,
            SequenceTooLongSnafu {
                seq_len,
                max_len: self.max_len,
            }
        );

        let sin = self
            .sin_freqs
            .i((.., ..seq_len, .., ..))
            .context(SliceTablesSnafu)?;
        let cos = self
            .cos_freqs
            .i((.., ..seq_len, .., ..))
            .context(SliceTablesSnafu)?;

        let query_rot = Self::rotate(query, &sin, &cos)?;
        let key_rot = Self::rotate(key, &sin, &cos)?;

        Ok((query_rot, key_rot))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor, D};
    use rstest::rstest;

    use super::{InterleavedRotaryEmbeddings, InterleavedRotaryEmbeddingsError};
    use crate::util::tests::{assert_tensor_eq, PseudoRandom};

    #[rstest]
    #[case(2)]
    #[case(10)]
    fn rotary_has_correct_output(#[case] max_len: usize) {
        let device = Device::Cpu;
        let rotary = InterleavedRotaryEmbeddings::new(4, max_len, 10_000.0, &device).unwrap();
        let query = Tensor::arange(0f32, 8f32, &device)
            .unwrap()
            .reshape((1, 2, 1, 4))
            .unwrap();
        let key = Tensor::arange(8f32, 16f32, &device)
            .unwrap()
            .reshape((1, 2, 1, 4))
            .unwrap();

        let (query_rot, key_rot) = rotary.forward(&query, &key).unwrap();

        // Position 0 is the identity; position 1 rotates the first pair by
        // 1 radian and the second pair by 0.01 radians.
        assert_tensor_eq(
            &query_rot,
            &Tensor::from_slice(
                &[
                    0.0000f32, 1.0000, 2.0000, 3.0000, -2.0461, 6.0674, 5.9297, 7.0596,
                ],
                (1, 2, 1, 4),
                &device,
            )
            .unwrap(),
            1e-4f32,
        );
        assert_tensor_eq(
            &key_rot,
            &Tensor::from_slice(
                &[
                    8.0000f32, 9.0000, 10.0000, 11.0000, -4.4555, 17.1216, 13.8493, 15.1392,
                ],
                (1, 2, 1, 4),
                &device,
            )
            .unwrap(),
            1e-4f32,
        );
    }

    #[test]
    fn rotation_at_position_zero_is_identity() {
        let device = Device::Cpu;
        let rotary = InterleavedRotaryEmbeddings::new(8, 4, 10_000.0, &device).unwrap();
        let query = Tensor::pseudo_random(16, &device)
            .reshape((2, 1, 1, 8))
            .unwrap();
        let key = query.affine(2.0, 1.0).unwrap();

        let (query_rot, key_rot) = rotary.forward(&query, &key).unwrap();

        assert_tensor_eq(&query_rot, &query, 1e-6f32);
        assert_tensor_eq(&key_rot, &key, 1e-6f32);
    }

    #[test]
    fn rotation_preserves_pair_norms() {
        let device = Device::Cpu;
        let rotary = InterleavedRotaryEmbeddings::new(8, 3, 10_000.0, &device).unwrap();
        let query = Tensor::pseudo_random(96, &device)
            .reshape((2, 3, 2, 8))
            .unwrap();
        let key = query.affine(-1.0, 0.5).unwrap();

        let (query_rot, key_rot) = rotary.forward(&query, &key).unwrap();

        let pair_norms = |xs: &Tensor| {
            xs.sqr()
                .unwrap()
                .reshape((2, 3, 2, 4, 2))
                .unwrap()
                .sum(D::Minus1)
                .unwrap()
        };
        assert_tensor_eq(&pair_norms(&query_rot), &pair_norms(&query), 1e-4f32);
        assert_tensor_eq(&pair_norms(&key_rot), &pair_norms(&key), 1e-4f32);
    }

    #[test]
    fn output_shape_matches_input_shape() {
        let device = Device::Cpu;
        let rotary = InterleavedRotaryEmbeddings::new(4, 8, 10_000.0, &device).unwrap();
        let query = Tensor::zeros((3, 5, 2, 4), candle_core::DType::F32, &device).unwrap();
        let key = Tensor::zeros((3, 5, 2, 4), candle_core::DType::F32, &device).unwrap();

        let (query_rot, key_rot) = rotary.forward(&query, &key).unwrap();

        assert_eq!(query_rot.shape(), query.shape());
        assert_eq!(key_rot.shape(), key.shape());
    }

    #[test]
    fn sequence_longer_than_table_is_rejected() {
        let device = Device::Cpu;
        let rotary = InterleavedRotaryEmbeddings::new(4, 2, 10_000.0, &device).unwrap();
        let query = Tensor::zeros((1, 4, 1, 4), candle_core::DType::F32, &device).unwrap();
        let key = query.clone();

        assert!(matches!(
            rotary.forward(&query, &key),
            Err(InterleavedRotaryEmbeddingsError::SequenceTooLong {
                seq_len: 4,
                max_len: 2,
            })
        ));
    }

    #[test]
    fn width_mismatch_is_rejected() {
        let device = Device::Cpu;
        let rotary = InterleavedRotaryEmbeddings::new(8, 4, 10_000.0, &device).unwrap();
        let query = Tensor::zeros((1, 2, 1, 4), candle_core::DType::F32, &device).unwrap();
        let key = query.clone();

        assert!(matches!(
            rotary.forward(&query, &key),
            Err(InterleavedRotaryEmbeddingsError::WidthMismatch {
                expected: 8,
                got: 4,
            })
        ));
    }
}
