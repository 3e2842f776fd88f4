//! Cluster module reaper - deletes VM-grouping objects with no members.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audit::ReapAuditLogger;
use crate::config::ReaperConfig;
use crate::error::{ReapError, Result, aggregate};
use crate::inventory::ObjectRef;

/// A VM-grouping object used for placement bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterModule {
    pub id: String,
    pub cluster: String,
}

/// Grouping object API of the platform.
#[async_trait]
pub trait ClusterModules: Send + Sync {
    async fn list_modules(&self) -> Result<Vec<ClusterModule>>;

    async fn list_members(&self, module_id: &str) -> Result<Vec<ObjectRef>>;

    async fn delete_module(&self, module_id: &str) -> Result<()>;
}

pub struct ModuleReaper {
    modules: Arc<dyn ClusterModules>,
    config: Arc<ReaperConfig>,
    audit: Arc<ReapAuditLogger>,
    cancel: CancellationToken,
}

impl ModuleReaper {
    pub fn new(
        modules: Arc<dyn ClusterModules>,
        config: Arc<ReaperConfig>,
        audit: Arc<ReapAuditLogger>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            modules,
            config,
            audit,
            cancel,
        }
    }

    /// Delete every module without members.
    ///
    /// Failures on one module never stop the others; they come back as one
    /// aggregate.
    pub async fn reap(&self) -> Result<()> {
        info!("Deleting empty cluster modules");

        let modules = self.modules.list_modules().await?;
        let mut errors = Vec::new();

        for module in modules {
            if self.cancel.is_cancelled() {
                return Err(ReapError::Cancelled);
            }
            let members = match self.modules.list_members(&module.id).await {
                Ok(members) => members,
                Err(e) => {
                    errors.push(e.context(format!("listing members of cluster module {}", module.id)));
                    continue;
                }
            };
            if !members.is_empty() {
                debug!(module = %module.id, members = members.len(), "Keeping cluster module");
                continue;
            }

            info!(module = %module.id, cluster = %module.cluster, "Deleting empty cluster module");
            self.audit.delete_cluster_module(&module.id);
            if self.config.dry_run {
                continue;
            }
            if let Err(e) = self.modules.delete_module(&module.id).await {
                errors.push(e.context(format!("deleting cluster module {}", module.id)));
            }
        }

        aggregate(errors)
    }
}
