//! Middleware pipeline applied to every inbound and outbound message.
//!
//! Both directions run the stages in their configured order. A failing
//! stage aborts the whole pass and the message goes no further.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::CanonicalMessage;

/// Endpoint name passed to stages when a transport has a single connector.
pub const DEFAULT_ENDPOINT: &str = "default";

/// Middleware error.
#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("Middleware '{stage}' failed: {reason}")]
    Stage { stage: String, reason: String },
    #[error("Invalid middleware config: {0}")]
    Config(String),
}

/// A named transformation applied to every message in both directions.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stage name, used in logs and errors.
    fn name(&self) -> &str;

    /// Transform a message travelling from the far end to applications.
    async fn handle_inbound(
        &self,
        message: CanonicalMessage,
        endpoint: &str,
    ) -> Result<CanonicalMessage, MiddlewareError>;

    /// Transform a message travelling from applications to the far end.
    async fn handle_outbound(
        &self,
        message: CanonicalMessage,
        endpoint: &str,
    ) -> Result<CanonicalMessage, MiddlewareError>;
}

/// Ordered, immutable sequence of middleware stages.
#[derive(Clone, Default)]
pub struct MiddlewareStack {
    stages: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    /// Create a stack from stages in application order.
    #[must_use]
    pub fn new(stages: Vec<Arc<dyn Middleware>>) -> Self {
        Self { stages }
    }

    /// Build a stack from configuration.
    ///
    /// # Errors
    /// Returns error if any stage rejects its config.
    pub fn from_config(configs: &[MiddlewareConfig]) -> Result<Self, MiddlewareError> {
        let stages = configs
            .iter()
            .map(MiddlewareConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(stages))
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage's inbound handler.
    ///
    /// # Errors
    /// Returns the first stage error; later stages are not run.
    pub async fn apply_inbound(
        &self,
        mut message: CanonicalMessage,
        endpoint: &str,
    ) -> Result<CanonicalMessage, MiddlewareError> {
        for stage in &self.stages {
            message = stage.handle_inbound(message, endpoint).await?;
        }
        Ok(message)
    }

    /// Run every stage's outbound handler.
    ///
    /// # Errors
    /// Returns the first stage error; later stages are not run.
    pub async fn apply_outbound(
        &self,
        mut message: CanonicalMessage,
        endpoint: &str,
    ) -> Result<CanonicalMessage, MiddlewareError> {
        for stage in &self.stages {
            message = stage.handle_outbound(message, endpoint).await?;
        }
        Ok(message)
    }
}

/// Configuration for one middleware stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MiddlewareConfig {
    AddressTranslation(AddressTranslationConfig),
}

impl MiddlewareConfig {
    fn build(&self) -> Result<Arc<dyn Middleware>, MiddlewareError> {
        match self {
            Self::AddressTranslation(config) => {
                Ok(Arc::new(AddressTranslator::from_config(config.clone())?))
            }
        }
    }
}

fn default_translator_name() -> String {
    "address_translation".to_string()
}

/// Address translation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressTranslationConfig {
    #[serde(default = "default_translator_name")]
    pub name: String,
    /// Internal `to_addr` values mapped to the external address to use.
    #[serde(default)]
    pub outbound_map: HashMap<String, String>,
}

/// Rewrites outbound `to_addr` through a fixed map and inbound
/// `from_addr` through its inverse.
///
/// Addresses missing from the map pass through untouched.
#[derive(Debug, Clone)]
pub struct AddressTranslator {
    name: String,
    outbound_map: HashMap<String, String>,
    inbound_map: HashMap<String, String>,
}

impl AddressTranslator {
    /// Build the translator and its inverse map.
    ///
    /// # Errors
    /// Returns error if two internal addresses map to the same external
    /// address, since the inverse would be ambiguous.
    pub fn from_config(config: AddressTranslationConfig) -> Result<Self, MiddlewareError> {
        let mut inbound_map = HashMap::with_capacity(config.outbound_map.len());
        for (internal, external) in &config.outbound_map {
            if let Some(existing) = inbound_map.insert(external.clone(), internal.clone()) {
                return Err(MiddlewareError::Config(format!(
                    "'{existing}' and '{internal}' both map to '{external}'"
                )));
            }
        }
        Ok(Self {
            name: config.name,
            outbound_map: config.outbound_map,
            inbound_map,
        })
    }

    /// Translator with the default name.
    ///
    /// # Errors
    /// See [`AddressTranslator::from_config`].
    pub fn new(outbound_map: HashMap<String, String>) -> Result<Self, MiddlewareError> {
        Self::from_config(AddressTranslationConfig {
            name: default_translator_name(),
            outbound_map,
        })
    }
}

#[async_trait]
impl Middleware for AddressTranslator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_inbound(
        &self,
        mut message: CanonicalMessage,
        _endpoint: &str,
    ) -> Result<CanonicalMessage, MiddlewareError> {
        if let Some(internal) = self.inbound_map.get(&message.from_addr) {
            message.from_addr.clone_from(internal);
        }
        Ok(message)
    }

    async fn handle_outbound(
        &self,
        mut message: CanonicalMessage,
        _endpoint: &str,
    ) -> Result<CanonicalMessage, MiddlewareError> {
        if let Some(external) = self.outbound_map.get(&message.to_addr) {
            message.to_addr.clone_from(external);
        }
        Ok(message)
    }
}
