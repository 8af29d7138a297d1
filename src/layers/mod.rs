pub mod embeddings;
pub use embeddings::{InterleavedRotaryEmbeddings, SinusoidalEmbeddings, SplitRotaryEmbeddings};
