//! Runtime configuration records.
//!
//! A [`RuntimeConfig`] describes one container: the schema it serves, the
//! optional cluster coordinates of the KV store, and per-index configuration
//! records handed to maintainers at construction time. Index configurations
//! are validated against the schema when the container opens; several records
//! may target the same index (per-variant tuning for kinds that support it).

use serde::{Deserialize, Serialize};

use crate::errors::{IndexError, RuntimeError, SchemaError};
use crate::kv::RetryConfig;
use crate::schema::Schema;

/// Configuration record for one index, typed by the kind identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfiguration {
    pub kind_identifier: String,
    pub index_name: String,
    pub model_type_name: String,
    /// Kind-specific payload, JSON-serializable on the wire.
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Clone)]
pub struct RuntimeConfig {
    /// Container name; becomes the trailing directory path component.
    pub name: Option<String>,
    pub schema: Schema,
    pub api_version: Option<u32>,
    pub cluster_url: Option<String>,
    pub index_configurations: Vec<IndexConfiguration>,
    /// Explicit directory path for multi-tenant isolation; defaults to
    /// `["manifold", <name>]`.
    pub root_path: Option<Vec<String>>,
    pub retry: RetryConfig,
}

impl RuntimeConfig {
    pub fn new(schema: Schema) -> Self {
        RuntimeConfig {
            name: None,
            schema,
            api_version: None,
            cluster_url: None,
            index_configurations: Vec::new(),
            root_path: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_index_configuration(mut self, configuration: IndexConfiguration) -> Self {
        self.index_configurations.push(configuration);
        self
    }

    pub fn with_root_path(mut self, path: Vec<String>) -> Self {
        self.root_path = Some(path);
        self
    }

    /// Directory path of the container root.
    pub fn resolved_root_path(&self) -> Vec<String> {
        match &self.root_path {
            Some(path) => path.clone(),
            None => vec![
                "manifold".to_string(),
                self.name.clone().unwrap_or_else(|| "default".to_string()),
            ],
        }
    }

    /// Validates every index configuration against the schema: the model
    /// type must exist, the index must exist, and the declared kind must
    /// match the resolved index's kind.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        for configuration in &self.index_configurations {
            if self.schema.entity(&configuration.model_type_name).is_none() {
                return Err(SchemaError::InvalidConfiguration(format!(
                    "unknown model type {:?} in configuration for index {:?}",
                    configuration.model_type_name, configuration.index_name
                ))
                .into());
            }
            let descriptor = self
                .schema
                .descriptor(&configuration.index_name)
                .ok_or_else(|| IndexError::Unknown(configuration.index_name.clone()))?;
            if descriptor.kind.identifier() != configuration.kind_identifier {
                return Err(IndexError::KindMismatch {
                    index: configuration.index_name.clone(),
                    expected: descriptor.kind.identifier().to_string(),
                    actual: configuration.kind_identifier.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Configuration records targeting one index, in declaration order.
    pub fn configurations_for(&self, index_name: &str) -> Vec<IndexConfiguration> {
        self.index_configurations
            .iter()
            .filter(|c| c.index_name == index_name)
            .cloned()
            .collect()
    }
}
