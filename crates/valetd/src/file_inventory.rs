//! Inventory collaborator backed by a TOML file.
//!
//! The file is re-read on every pull, so edits show up at the next refresh.
//!
//! ```toml
//! [[hosts]]
//! name = "compute-1"
//! rack = "r1"
//! vcpus = 32
//! memory_mb = 131072
//! local_gb = 1000
//!
//! [[flavors]]
//! id = "1"
//! name = "m1.small"
//! vcpus = 1
//! memory_mb = 2048
//! disk_gb = 20
//!
//! [[aggregates]]
//! name = "az1"
//! kind = "availability_zone"
//! hosts = ["compute-1"]
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use valet_engine::Inventory;
use valet_state::{AggregateInventory, FlavorInventory, HostInventory};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InventoryFile {
    hosts: Vec<HostInventory>,
    flavors: Vec<FlavorInventory>,
    aggregates: Vec<AggregateInventory>,
}

pub struct FileInventory {
    path: PathBuf,
}

impl FileInventory {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    async fn load(&self) -> anyhow::Result<InventoryFile> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading inventory {}", self.path.display()))?;
        let file = toml::from_str(&content)
            .with_context(|| format!("parsing inventory {}", self.path.display()))?;
        Ok(file)
    }
}

#[async_trait]
impl Inventory for FileInventory {
    async fn list_hosts(&self) -> anyhow::Result<Vec<HostInventory>> {
        Ok(self.load().await?.hosts)
    }

    async fn list_flavors(&self) -> anyhow::Result<Vec<FlavorInventory>> {
        Ok(self.load().await?.flavors)
    }

    async fn list_aggregates(&self) -> anyhow::Result<Vec<AggregateInventory>> {
        Ok(self.load().await?.aggregates)
    }
}
