//! Container pruner - destroys empty folders and resource pools leaf-first.
//!
//! A container is a candidate only while nothing of a different kind lives
//! anywhere beneath it. Candidates are destroyed deepest first so that no
//! parent goes before its own empty children.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audit::ReapAuditLogger;
use crate::config::ReaperConfig;
use crate::error::{ReapError, Result, ResultExt, aggregate};
use crate::inventory::{ContainerKind, Inventory, InventoryObject, ObjectKind, PATH_SEPARATOR};
use crate::lister::Lister;
use crate::task::{PendingTask, wait_for_tasks};

/// Whether `descendants` holds anything that is not a `kind` container.
///
/// Kinds the reaper does not know are foreign as well.
pub fn is_occupied(descendants: &[InventoryObject], kind: ContainerKind) -> bool {
    let kind = ObjectKind::from(kind);
    descendants.iter().any(|d| d.kind() != &kind)
}

/// Order containers deepest first. Ties are broken by path for stable logs.
pub fn sort_leaf_first(objects: &mut [InventoryObject]) {
    objects.sort_by(|a, b| b.depth().cmp(&a.depth()).then_with(|| a.path.cmp(&b.path)));
}

/// Whether `path` lies strictly below `ancestor`.
fn is_descendant(path: &str, ancestor: &str) -> bool {
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with(PATH_SEPARATOR))
}

/// Where a container stands with respect to its deletion marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerState {
    Unmarked,
    /// First seen after the cutoff.
    Fresh,
    Expired,
}

/// Recursively destroys empty containers of a single kind.
pub struct ContainerPruner {
    inventory: Arc<dyn Inventory>,
    lister: Lister,
    config: Arc<ReaperConfig>,
    audit: Arc<ReapAuditLogger>,
    cancel: CancellationToken,
}

impl ContainerPruner {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        config: Arc<ReaperConfig>,
        audit: Arc<ReapAuditLogger>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            lister: Lister::new(Arc::clone(&inventory)),
            inventory,
            config,
            audit,
            cancel,
        }
    }

    /// Destroy every empty `kind` container below `root_path`.
    ///
    /// The root itself is never destroyed.
    pub async fn prune(&self, root_path: &str, kind: ObjectKind) -> Result<()> {
        let kind = ContainerKind::try_from(kind)?;
        if root_path.is_empty() {
            return Err(ReapError::InvalidInput(format!(
                "cannot use empty string to delete children of type {}",
                kind
            )));
        }

        info!(root = %root_path, kind = %kind, "Deleting empty children");

        let candidates = self.lister.list(root_path, &[kind.into()]).await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let occupied = self.occupied(&candidates, kind).await?;

        let mut destroy = match self.config.cutoff() {
            Some(cutoff) => self.filter_by_marker(candidates, kind, cutoff).await?,
            None => candidates,
        };
        destroy.retain(|candidate| {
            let keep = !occupied.contains(&candidate.path);
            if !keep {
                debug!(path = %candidate.path, "Skipping occupied container");
            }
            keep
        });

        sort_leaf_first(&mut destroy);
        self.destroy(&destroy, kind).await
    }

    /// Paths of candidates that still hold a foreign descendant.
    async fn occupied(
        &self,
        candidates: &[InventoryObject],
        kind: ContainerKind,
    ) -> Result<HashSet<String>> {
        let mut occupied = HashSet::new();
        for candidate in candidates {
            let descendants = self
                .lister
                .list(&candidate.path, &[])
                .await
                .with_context(|| format!("listing children of {}", candidate.path))?;
            if is_occupied(&descendants, kind) {
                occupied.insert(candidate.path.clone());
            }
        }
        Ok(occupied)
    }

    /// Keep the candidates whose deletion marker is older than `cutoff`,
    /// marking the ones seen for the first time.
    async fn filter_by_marker(
        &self,
        candidates: Vec<InventoryObject>,
        kind: ContainerKind,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<InventoryObject>> {
        let key = self.marker_key().await?;
        let timestamp = self.config.now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut expired = Vec::new();
        let mut errors = Vec::new();

        for candidate in candidates {
            if self.cancel.is_cancelled() {
                return Err(ReapError::Cancelled);
            }
            match marker_state(&candidate, key, cutoff)? {
                MarkerState::Expired => expired.push(candidate),
                MarkerState::Fresh => {
                    debug!(path = %candidate.path, "Skipping container marked after cutoff");
                }
                MarkerState::Unmarked => {
                    info!(path = %candidate.path, timestamp = %timestamp, "Marking container for deletion");
                    self.audit.mark_container(
                        kind.to_string().as_str(),
                        &candidate.reference.id,
                        &candidate.path,
                        &timestamp,
                    );
                    let Some(key) = key else {
                        continue;
                    };
                    if self.config.dry_run {
                        continue;
                    }
                    if let Err(e) = self
                        .inventory
                        .set_custom_field(&candidate.reference, key, &timestamp)
                        .await
                    {
                        errors.push(e.context(format!("marking {}", candidate.path)));
                    }
                }
            }
        }

        aggregate(errors)?;
        Ok(expired)
    }

    /// Key of the deletion marker field. Created on first use unless
    /// running dry.
    async fn marker_key(&self) -> Result<Option<i32>> {
        let name = &self.config.deletion_marker;
        if let Some(key) = self.inventory.find_custom_field(name).await? {
            return Ok(Some(key));
        }

        info!(field = %name, "Creating the deletion field");
        if self.config.dry_run {
            return Ok(None);
        }
        let key = self
            .inventory
            .add_custom_field(name)
            .await
            .with_context(|| format!("creating custom field {}", name))?;
        Ok(Some(key))
    }

    async fn destroy(&self, ordered: &[InventoryObject], kind: ContainerKind) -> Result<()> {
        let mut tasks = Vec::new();
        let mut errors = Vec::new();
        let mut failed: Vec<&str> = Vec::new();

        for container in ordered {
            if self.cancel.is_cancelled() {
                return Err(ReapError::Cancelled);
            }
            if failed.iter().any(|f| is_descendant(f, &container.path)) {
                debug!(path = %container.path, "Skipping ancestor of a container that could not be destroyed");
                continue;
            }

            info!(kind = %kind, path = %container.path, "Destroying container");
            self.audit.destroy_container(
                kind.to_string().as_str(),
                &container.reference.id,
                &container.path,
            );
            if self.config.dry_run {
                continue;
            }

            match self.inventory.destroy(&container.reference).await {
                Ok(task) => tasks.push(PendingTask::new(task, container.path.clone())),
                Err(e) => {
                    errors.push(e.context(format!("creating Destroy task for {}", container.path)));
                    failed.push(&container.path);
                }
            }
        }

        let waited = wait_for_tasks(self.inventory.as_ref(), tasks, &self.cancel)
            .await
            .with_context(|| format!("waiting for {} destroy tasks to finish", kind));
        if let Err(e) = waited {
            if e.is_cancelled() {
                return Err(e);
            }
            errors.push(e);
        }

        aggregate(errors)
    }
}

fn marker_state(
    candidate: &InventoryObject,
    key: Option<i32>,
    cutoff: DateTime<Utc>,
) -> Result<MarkerState> {
    let Some(value) = key.and_then(|key| candidate.custom_value(key)) else {
        return Ok(MarkerState::Unmarked);
    };
    if value.is_empty() {
        return Ok(MarkerState::Unmarked);
    }

    let marked = DateTime::parse_from_rfc3339(value).map_err(|_| ReapError::InvalidMarker {
        path: candidate.path.clone(),
        value: value.to_string(),
    })?;
    if marked.with_timezone(&Utc) > cutoff {
        Ok(MarkerState::Fresh)
    } else {
        Ok(MarkerState::Expired)
    }
}
