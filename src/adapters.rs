//! Wires storage driver configuration to concrete containers.
//!
//! The runtime core is generic over its KV backend; deployments pick a
//! driver here. The in-memory driver ships in this workspace; cluster-backed
//! drivers implement the `manifold_core::kv` traits out of tree and open
//! their containers through [`Container::open`] directly.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use manifold_core::{Codec, Container, RuntimeConfig, RuntimeError};
use manifold_memkv::MemKv;

/// Storage driver selection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum StorageDriver {
    /// Ephemeral in-memory backend (tests, experiments).
    #[default]
    InMemory,
    /// In-memory backend with a custom per-transaction timeout.
    InMemoryWithTimeout { timeout_ms: u64 },
}

impl StorageDriver {
    fn build(&self) -> MemKv {
        match self {
            StorageDriver::InMemory => MemKv::new(),
            StorageDriver::InMemoryWithTimeout { timeout_ms } => {
                MemKv::new().with_timeout(Duration::from_millis(*timeout_ms))
            }
        }
    }
}

/// Opens a container for the configured schema on the selected driver.
pub async fn open_container(
    driver: &StorageDriver,
    config: RuntimeConfig,
    codec: Arc<dyn Codec>,
) -> Result<Arc<Container<MemKv>>, RuntimeError> {
    Container::open(driver.build(), config, codec).await
}
