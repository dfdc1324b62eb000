mod chunker;

pub use chunker::{Chunker, ChunkerError};
