//! Cosine math over fixed-dimension vectors.
//!
//! The `f32` variants sit on the search hot path; the `f64` variants are used
//! at ingestion time where the upstream vectors arrive in double precision.
//! A zero-magnitude operand yields similarity 0 (distance 1).

use crate::errors::{IndexError, IndexResult};

pub fn cosine_similarity32(a: &[f32], b: &[f32]) -> IndexResult<f32> {
    if a.len() != b.len() {
        return Err(IndexError::LengthMismatch { left: a.len(), right: b.len() });
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

pub fn cosine_similarity64(a: &[f64], b: &[f64]) -> IndexResult<f64> {
    if a.len() != b.len() {
        return Err(IndexError::LengthMismatch { left: a.len(), right: b.len() });
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

pub fn cosine_distance32(a: &[f32], b: &[f32]) -> IndexResult<f32> {
    Ok(1.0 - cosine_similarity32(a, b)?)
}

pub fn cosine_distance64(a: &[f64], b: &[f64]) -> IndexResult<f64> {
    Ok(1.0 - cosine_similarity64(a, b)?)
}

/// Narrows an ingestion-time vector to the precision the indexes store.
pub fn reduce_precision(v: &[f64]) -> Vec<f32> {
    v.iter().map(|&f| f as f32).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("vector source is not a JSON number array: {0}")]
    Json(#[from] serde_json::Error),

    #[error("vector source is empty")]
    Empty,

    #[error("vector component {0} is not finite")]
    NonFinite(usize),

    #[error("vector component {0} does not fit in 32-bit precision")]
    OutOfRange(usize),
}

/// Decodes a vector-source string (a JSON array of numbers).
pub fn decode_vector_source(source: &str) -> Result<Vec<f64>, DecodeError> {
    let vector: Vec<f64> = serde_json::from_str(source)?;
    if vector.is_empty() {
        return Err(DecodeError::Empty);
    }
    if let Some(pos) = vector.iter().position(|f| !f.is_finite()) {
        return Err(DecodeError::NonFinite(pos));
    }
    if let Some(pos) = vector.iter().position(|f| f.abs() > f32::MAX as f64) {
        return Err(DecodeError::OutOfRange(pos));
    }
    Ok(vector)
}
