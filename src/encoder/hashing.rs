//! Deterministic feature-hashing encoder.
//!
//! Maps text to a fixed-width vector without any model: lowercase word
//! unigrams fill the first half of the vector, character trigrams the next
//! quarter, and a few length statistics the remainder. The result is
//! L2-normalized. Identical text always yields an identical vector, which
//! makes this backend suitable for tests and offline runs.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::EncoderError;

use super::Encoder;

/// Feature-hashing text encoder.
#[derive(Debug, Clone)]
pub struct HashEncoder {
    dimension: usize,
}

impl HashEncoder {
    /// Creates an encoder producing vectors of `dimension` (at least 1).
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Embeds a single text.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimension];
        if text.is_empty() {
            return embedding;
        }

        let lower = text.to_lowercase();

        let words: Vec<&str> = lower.split_whitespace().collect();
        let word_dim = self.dimension / 2;
        for word in &words {
            let pos = hash_to_index(word, word_dim);
            embedding[pos] += 1.0 / words.len() as f32;
        }

        let offset = word_dim;
        let trigram_dim = self.dimension / 4;
        let chars: Vec<char> = lower.chars().collect();
        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            let pos = offset + hash_to_index(&trigram, trigram_dim);
            if pos < self.dimension {
                embedding[pos] += 1.0;
            }
        }

        let stats_offset = offset + trigram_dim;
        let remaining = self.dimension.saturating_sub(stats_offset);
        if remaining > 0 {
            embedding[stats_offset] = (text.len() as f32 / 1000.0).min(1.0);
        }
        if remaining > 1 {
            embedding[stats_offset + 1] = (words.len() as f32 / 200.0).min(1.0);
        }

        normalize(&mut embedding);
        embedding
    }
}

#[async_trait]
impl Encoder for HashEncoder {
    fn name(&self) -> &str {
        "hash"
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    /// Hashing runs on the blocking pool so device workers sharing the
    /// runtime keep making progress.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError> {
        let encoder = self.clone();
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            texts
                .iter()
                .map(|t| encoder.embed_text(t))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| EncoderError::Worker(e.to_string()))
    }
}

/// Hashes a string to an index in [0, max_index).
fn hash_to_index(input: &str, max_index: usize) -> usize {
    if max_index == 0 {
        return 0;
    }
    let digest = Sha256::digest(input.as_bytes());
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize;
    value % max_index
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}
