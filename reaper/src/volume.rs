//! Volume reaper - deletes block-storage volumes left behind by a lease.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audit::ReapAuditLogger;
use crate::config::ReaperConfig;
use crate::error::{ReapError, Result, ResultExt, aggregate};
use crate::inventory::{Inventory, TaskRef};
use crate::task::{PendingTask, wait_for_tasks};

/// Metadata entry type describing the claim a volume is bound to.
pub const PVC_ENTITY_TYPE: &str = "PERSISTENT_VOLUME_CLAIM";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One structured metadata entry of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetadata {
    pub entity_type: String,
    pub entity_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: Vec<KeyValue>,
}

impl EntityMetadata {
    pub fn is_claim(&self) -> bool {
        self.entity_type == PVC_ENTITY_TYPE
    }

    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.iter().any(|l| l.key == key && l.value == value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: Vec<EntityMetadata>,
}

impl Volume {
    /// The claim metadata entry. The last one wins when several exist.
    pub fn claim(&self) -> Option<&EntityMetadata> {
        self.metadata.iter().rev().find(|m| m.is_claim())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub offset: u64,
    pub limit: u64,
    pub total_records: u64,
}

/// Query by label, continuing at `cursor` when set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub labels: Vec<KeyValue>,
    #[serde(default)]
    pub cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePage {
    pub volumes: Vec<Volume>,
    pub cursor: Cursor,
}

impl VolumePage {
    /// No further page follows this one.
    pub fn is_last(&self) -> bool {
        self.cursor.offset == self.cursor.total_records || self.volumes.is_empty()
    }
}

/// Paginated block-storage volume catalog.
#[async_trait]
pub trait VolumeCatalog: Send + Sync {
    async fn query(&self, filter: &QueryFilter) -> Result<VolumePage>;

    /// Issue a volume delete. The task is awaited through [`Inventory::wait_task`].
    async fn delete_volume(&self, volume_id: &str) -> Result<TaskRef>;
}

/// Deletes volumes whose claim carries the owner label.
pub struct VolumeReaper {
    catalog: Arc<dyn VolumeCatalog>,
    inventory: Arc<dyn Inventory>,
    config: Arc<ReaperConfig>,
    audit: Arc<ReapAuditLogger>,
    cancel: CancellationToken,
}

impl VolumeReaper {
    pub fn new(
        catalog: Arc<dyn VolumeCatalog>,
        inventory: Arc<dyn Inventory>,
        config: Arc<ReaperConfig>,
        audit: Arc<ReapAuditLogger>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            inventory,
            config,
            audit,
            cancel,
        }
    }

    pub async fn reap(&self, owner_label: &str) -> Result<()> {
        if owner_label.is_empty() {
            return Err(ReapError::InvalidInput(
                "cannot use empty string as owner label".to_string(),
            ));
        }

        info!(owner = %owner_label, "Deleting volumes");

        let matched = self.find(owner_label).await?;
        if matched.is_empty() {
            return Ok(());
        }

        let mut tasks = Vec::new();
        let mut errors = Vec::new();

        for (volume, claim) in &matched {
            if self.cancel.is_cancelled() {
                return Err(ReapError::Cancelled);
            }
            info!(volume = %volume.id, claim = %claim, "Deleting volume");
            self.audit.delete_volume(&volume.id, claim);
            if self.config.dry_run {
                continue;
            }

            match self.catalog.delete_volume(&volume.id).await {
                Ok(task) => tasks.push(PendingTask::new(task, format!("volume {}", volume.id))),
                Err(e) => errors.push(e.context(format!("deleting volume {}", volume.id))),
            }
        }

        let waited = wait_for_tasks(self.inventory.as_ref(), tasks, &self.cancel)
            .await
            .context("waiting for volume delete tasks to finish");
        if let Err(e) = waited {
            if e.is_cancelled() {
                return Err(e);
            }
            errors.push(e);
        }

        aggregate(errors)
    }

    /// Every volume whose claim is labelled exactly with `owner_label`,
    /// paired with the claim name.
    async fn find(&self, owner_label: &str) -> Result<Vec<(Volume, String)>> {
        let key = &self.config.owner_label_key;
        let mut filter = QueryFilter {
            labels: vec![KeyValue::new(key.as_str(), owner_label)],
            cursor: None,
        };
        let mut matched = Vec::new();

        loop {
            let page = self
                .catalog
                .query(&filter)
                .await
                .context("querying volumes")?;
            let last = page.is_last();
            debug!(count = page.volumes.len(), offset = page.cursor.offset, total = page.cursor.total_records, "Fetched volume page");

            for volume in page.volumes {
                let Some(claim) = volume.claim() else {
                    continue;
                };
                // The query filter alone is not trusted.
                if !claim.has_label(key, owner_label) {
                    debug!(volume = %volume.id, "Skipping volume without exact owner label");
                    continue;
                }
                let name = claim.entity_name.clone();
                matched.push((volume, name));
            }

            if last {
                break;
            }
            filter.cursor = Some(page.cursor);
        }

        Ok(matched)
    }
}
