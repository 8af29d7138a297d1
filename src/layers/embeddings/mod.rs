/// Embedding layers.
mod interleaved;
pub use interleaved::{InterleavedRotaryEmbeddings, InterleavedRotaryEmbeddingsError};

mod sinusoidal;
pub use sinusoidal::{SinusoidalEmbeddings, SinusoidalEmbeddingsError};

mod split;
pub use split::{SplitRotaryEmbeddings, SplitRotaryEmbeddingsError};
