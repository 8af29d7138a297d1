use candle_core::{Device, IndexOp, Tensor, D};
use snafu::{ensure, ResultExt, Snafu};

/// Errors for half-split rotary embeddings.
#[derive(Debug, Snafu)]
pub enum SplitRotaryEmbeddingsError {
    #[snafu(display("Cannot apply rotary embeddings to input"))]
    ApplyEmbeddings { source: candle_core::Error },

    #[snafu(display("Cannot build frequency tables"))]
    BuildTables { source: candle_core::Error },

    #[snafu(display("Invalid input rank, expected at least {expected}, got {got}"))]
    InvalidRank { expected: usize, got: usize },

    #[snafu(display("Cannot reshape frequency table for broadcasting"))]
    ReshapeTable { source: candle_core::Error },

    #[snafu(display("Query and key sequence lengths differ, {query_seq_len} vs {key_seq_len}"))]
    SequenceMismatch {
        query_seq_len: usize,
        key_seq_len: usize,
    },

    #[snafu(display("Sequence length {seq_len} exceeds precomputed length {max_len}"))]
    SequenceTooLong { seq_len: usize, max_len: usize },

    #[snafu(display("Cannot slice frequency tables"))]
    SliceTables { source: candle_core::Error },

    #[snafu(display(
        "Frequency table shape ({table_len}, {table_width}) does not match input ({seq_len}, {width})"
    ))]
    TableShapeMismatch {
        table_len: usize,
        table_width: usize,
        seq_len: usize,
        width: usize,
    },

    #[snafu(display("Invalid head width, expected {expected}, got {got}"))]
    WidthMismatch { expected: usize, got: usize },

    #[snafu(display("Rotary width must be even, was {width}"))]
    WidthNotEven { width: usize },
}

/// Rotary embeddings, half-split complex convention.
///
/// The same rotation as `InterleavedRotaryEmbeddings`, expressed as complex
/// multiplication: every channel pair is read as a complex number with the
/// even channel as real and the odd channel as imaginary part, and
/// multiplied by `cos(mθ) + i·sin(mθ)`. The frequency tables are kept at
/// half width, one angle per pair, and broadcast against the split
/// components instead of being duplicated to full width.
#[derive(Debug)]
pub struct SplitRotaryEmbeddings {
    sin: Tensor,
    cos: Tensor,
    max_len: usize,
    width: usize,
}

impl SplitRotaryEmbeddings {
    /// Construct a half-split rotary embedding module.
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
    ) -> Result<Self, SplitRotaryEmbeddingsError> {
        ensure!(width % 2 == 0, WidthNotEvenSnafu { width });

        // θ_k = base^(-2k/d)
        let inv_freq: Vec<_> = (0..width / 2)
            .map(|k| base.powf(-((2 * k) as f32 / width as f32)))
            .collect();
        let inv_freq =
            Tensor::from_vec(inv_freq, (1, width / 2), device).context(BuildTablesSnafu)?;
        let position = Tensor::arange(0.0, max_len as f32, device)
            .and_then(|xs| xs.unsqueeze(1))
            .context(BuildTablesSnafu)?;
        let angles = position.broadcast_mul(&inv_freq).context(BuildTablesSnafu)?;

        Ok(SplitRotaryEmbeddings {
            sin: angles.sin().context(BuildTablesSnafu)?,
            cos: angles.cos().context(BuildTablesSnafu)?,
            max_len,
            width,
        })
    }

    /// Sine table, one angle per channel pair.
    ///
    /// *Shape:* `(max_len, width / 2)`
    pub fn sin(&self) -> &Tensor {
        &self.sin
    }

    /// Cosine table, one angle per channel pair.
    ///
    /// *Shape:* `(max_len, width / 2)`
    pub fn cos(&self) -> &Tensor {
        &self.cos
    }

    /// Reshape a half-width frequency table to broadcast against a split
    /// component tensor: singleton axes everywhere except the sequence
    /// axis (axis 1) and the pair axis (last). The table must cover the
    /// component shape exactly.
    fn reshape_for_broadcast(
        table: &Tensor,
        components: &Tensor,
    ) -> Result<Tensor, SplitRotaryEmbeddingsError> {
        let (table_len, table_width) = table.shape().dims2().context(ReshapeTableSnafu)?;
        let dims = components.dims();
        let seq_len = dims[1];
        let width = dims[dims.len() - 1];

        ensure!(
            table_len == seq_len && table_width == width,
            TableShapeMismatchSnafu {
                table_len,
                table_width,
                seq_len,
                width,
            }
        );

        let shape: Vec<_> = dims
            .iter()
            .enumerate()
            .map(|(axis, &dim)| {
                if axis == 1 || axis == dims.len() - 1 {
                    dim
                } else {
                    1
                }
            })
            .collect();
        table.reshape(shape).context(ReshapeTableSnafu)
    }

    fn rotate(
        input: &Tensor,
        sin: &Tensor,
        cos: &Tensor,
    ) -> Result<Tensor, SplitRotaryEmbeddingsError> {
        let dims = input.dims().to_vec();
        let width = dims[dims.len() - 1];

        // Read the channels as width/2 complex pairs.
        let mut pair_dims = dims[..dims.len() - 1].to_vec();
        pair_dims.push(width / 2);
        pair_dims.push(2);
        let pairs = input.reshape(pair_dims).context(ApplyEmbeddingsSnafu)?;
        let real = pairs
            .narrow(D::Minus1, 0, 1)
            .and_then(|xs| xs.squeeze(D::Minus1))
            .context(ApplyEmbeddingsSnafu)?;
        let imag = pairs
            .narrow(D::Minus1, 1, 1)
            .and_then(|xs| xs.squeeze(D::Minus1))
            .context(ApplyEmbeddingsSnafu)?;

        let sin = Self::reshape_for_broadcast(sin, &real)?;
        let cos = Self::reshape_for_broadcast(cos, &real)?;

        // (re + i·im)(cos + i·sin)
        let out_real = real
            .broadcast_mul(&cos)
            .and_then(|xs| xs.sub(&imag.broadcast_mul(&sin)?))
            .context(ApplyEmbeddingsSnafu)?;
        let out_imag = real
            .broadcast_mul(&sin)
            .and_then(|xs| xs.add(&imag.broadcast_mul(&cos)?))
            .context(ApplyEmbeddingsSnafu)?;

        // Re-interleave the rotated pairs into the original layout.
        Tensor::stack(&[&out_real, &out_imag], dims.len())
            .and_then(|xs| xs.reshape(dims))
            .context(ApplyEmbeddingsSnafu)
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
    ) -> Result<(Tensor, Tensor), SplitRotaryEmbeddingsError> {
        let query_dims = query.dims();
        let key_dims = key.dims();
        ensure!(
            query_dims.len() >= 2,
            InvalidRankSnafu {
                expected: 2usize,
                got: query_dims.len(),
            }
        );
        ensure!(
            key_dims.len() >= 2,
            InvalidRankSnafu {
                expected: 2usize,
                got: key_dims.len(),
            }
        );

        let seq_len = query_dims[1];
        let width = query_dims[query_dims.len() - 1];
        let key_seq_len = key_dims[1];
        let key_width = key_dims[key_dims.len() - 1];

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

        let sin = self.sin.i((..seq_len, ..)).context(SliceTablesSnafu)?;
        let cos = self.cos.i((..seq_len, ..)).context(SliceTablesSnafu)?;

        let query_rot = Self::rotate(query, &sin, &cos)?;
        let key_rot = Self::rotate(key, &sin, &cos)?;

        Ok((query_rot, key_rot))
    }
}
