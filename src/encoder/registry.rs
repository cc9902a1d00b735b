//! Encoder type -> factory mapping.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::EncoderError;

use super::{Device, Encoder, EncoderConfig, HashEncoder, HttpEncoder};

/// Key of the feature-hashing backend.
pub const HASH_ENCODER: &str = "hash";

/// Key of the embeddings-endpoint backend.
pub const ARCTIC_ENCODER: &str = "arctic";

/// Builds an encoder bound to one device.
pub type EncoderFactory =
    Arc<dyn Fn(&EncoderConfig, Device) -> Result<Box<dyn Encoder>, EncoderError> + Send + Sync>;

/// Encoder types available out of the box.
pub fn supported_encoders() -> Vec<&'static str> {
    vec![ARCTIC_ENCODER, HASH_ENCODER]
}

/// Startup-time map from encoder type to factory.
#[derive(Clone)]
pub struct EncoderRegistry {
    factories: BTreeMap<String, EncoderFactory>,
}

impl fmt::Debug for EncoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderRegistry")
            .field("encoders", &self.names())
            .finish()
    }
}

impl Default for EncoderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl EncoderRegistry {
    /// Creates a registry with no encoders.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Creates a registry holding the built-in encoders.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(HASH_ENCODER, |config, _device| {
            Ok(Box::new(HashEncoder::new(config.dimension)) as Box<dyn Encoder>)
        });
        registry.register(ARCTIC_ENCODER, |config, device| {
            Ok(Box::new(HttpEncoder::from_env(config, device)?) as Box<dyn Encoder>)
        });
        registry
    }

    /// Registers (or replaces) a factory.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&EncoderConfig, Device) -> Result<Box<dyn Encoder>, EncoderError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Returns true if the type is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered types, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Fails with `UnknownEncoder` if the type is not registered.
    pub fn check(&self, name: &str) -> Result<(), EncoderError> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(EncoderError::UnknownEncoder {
                name: name.to_string(),
                available: self.names().join(", "),
            })
        }
    }

    /// Instantiates the configured encoder on `device`.
    pub fn create(
        &self,
        config: &EncoderConfig,
        device: Device,
    ) -> Result<Box<dyn Encoder>, EncoderError> {
        match self.factories.get(&config.encoder_type) {
            Some(factory) => factory(config, device),
            None => Err(EncoderError::UnknownEncoder {
                name: config.encoder_type.clone(),
                available: self.names().join(", "),
            }),
        }
    }
}
