use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChunkerError {
    #[error("Invalid chunker config: {0}")]
    InvalidConfig(String),
}

/// Splits text into fixed-size windows that overlap by a fixed amount.
///
/// Sizes and offsets are counted in `char`s so a chunk never cuts a code point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, ChunkerError> {
        if chunk_size == 0 {
            return Err(ChunkerError::InvalidConfig(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if overlap >= chunk_size {
            return Err(ChunkerError::InvalidConfig(format!(
                "overlap ({}) must be smaller than chunk size ({})",
                overlap, chunk_size
            )));
        }

        Ok(Self { chunk_size, overlap })
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with_offsets(text)
            .into_iter()
            .map(|(_, chunk)| chunk)
            .collect()
    }

    /// Like [`Chunker::split`], but pairs every chunk with its starting char offset.
    pub fn split_with_offsets(&self, text: &str) -> Vec<(usize, String)> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let step = self.chunk_size - self.overlap;

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < total {
            let end = (start + self.chunk_size).min(total);
            chunks.push((start, chars[start..end].iter().collect()));

            if end == total {
                break;
            }
            start += step;
        }

        chunks
    }
}
