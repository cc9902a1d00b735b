//! Embedding backends and the pool that drives them.
//!
//! Backends implement [`Encoder`] and are created through an
//! [`EncoderRegistry`] keyed by encoder type. The [`EncoderPool`] splits the
//! rendered texts into batches, spreads them round-robin across the resolved
//! devices and reassembles the rows in input order.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use subset_forge::encoder::{DevicePool, EncoderConfig, EncoderPool, EncoderRegistry};
//!
//! let devices = DevicePool::resolve(Some(2), 4, false)?;
//! let pool = EncoderPool::new(Arc::new(EncoderRegistry::with_builtins()), devices);
//! let embeddings = pool.encode_all(&texts, &EncoderConfig::default()).await?;
//! ```

pub mod cache;
pub mod device;
pub mod hashing;
pub mod http;
pub mod pool;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EncoderError;

pub use cache::{fingerprint, EmbeddingCache};
pub use device::{Device, DevicePool};
pub use hashing::HashEncoder;
pub use http::HttpEncoder;
pub use pool::EncoderPool;
pub use registry::{supported_encoders, EncoderFactory, EncoderRegistry};

/// Default encoder type.
pub const DEFAULT_ENCODER_TYPE: &str = "arctic";

/// Default model served by the embedding endpoint.
pub const DEFAULT_ENCODER_MODEL: &str = "Snowflake/snowflake-arctic-embed-l-v2.0";

/// Default number of texts per encoding batch.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Default output dimension for encoders with a configurable width.
pub const DEFAULT_EMBEDDING_DIM: usize = 128;

/// Text to vector capability.
///
/// Implementations must return exactly one vector per input text, in order,
/// all of the same length.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Output dimension, if known before the first call.
    fn dimension(&self) -> Option<usize>;

    /// Encodes a batch of texts.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError>;
}

/// Encoder selection and batching parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Registry key of the backend.
    pub encoder_type: String,
    /// Model identifier passed to the backend.
    pub model: String,
    /// Texts per batch.
    pub batch_size: usize,
    /// Prefix prepended to every text before encoding.
    pub instruction: Option<String>,
    /// Accelerators to use; `None` uses every detected one.
    pub num_gpus: Option<usize>,
    /// Output width for backends that take one (the hash encoder).
    pub dimension: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            encoder_type: DEFAULT_ENCODER_TYPE.to_string(),
            model: DEFAULT_ENCODER_MODEL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            instruction: None,
            num_gpus: None,
            dimension: DEFAULT_EMBEDDING_DIM,
        }
    }
}

impl EncoderConfig {
    /// Applies the instruction prefix, if any.
    pub fn prepare(&self, text: &str) -> String {
        match &self.instruction {
            Some(prefix) => format!("{}{}", prefix, text),
            None => text.to_string(),
        }
    }
}
