use rusqlite::functions::FunctionFlags;
use thiserror::Error;

/// Name of the SQL function used to rank chunks.
pub const DISTANCE_FUNCTION: &str = "vector_distance_cos";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VectorError {
    #[error("Malformed vector blob of {0} bytes")]
    Malformed(usize),
    #[error("Vector dimension mismatch: {0} vs {1}")]
    DimensionMismatch(usize, usize),
}

pub fn to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn from_blob(blob: &[u8]) -> Result<Vec<f32>, VectorError> {
    if blob.len() % 4 != 0 {
        return Err(VectorError::Malformed(blob.len()));
    }

    Ok(blob
        .chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect())
}

/// `1 - cos(a, b)`. A zero vector has no direction and sits at distance 1 from everything.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32, VectorError> {
    if a.len() != b.len() {
        return Err(VectorError::DimensionMismatch(a.len(), b.len()));
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(1.0);
    }

    Ok(1.0 - dot / (norm_a * norm_b))
}

/// Registers `vector_distance_cos(blob, blob)` on a connection.
pub fn register_functions(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        DISTANCE_FUNCTION,
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a = ctx.get::<Vec<u8>>(0)?;
            let b = ctx.get::<Vec<u8>>(1)?;

            let distance = from_blob(&a)
                .and_then(|a| from_blob(&b).and_then(|b| cosine_distance(&a, &b)))
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;

            Ok(distance as f64)
        },
    )
}
