//! VM reaper - powers off and destroys stale VMs below a folder.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::ReapAuditLogger;
use crate::config::ReaperConfig;
use crate::error::{ReapError, Result, ResultExt, aggregate};
use crate::inventory::{Inventory, InventoryObject, ObjectKind, PowerState};
use crate::lister::Lister;
use crate::task::{PendingTask, wait_for_tasks};

/// VMs selected for reclamation, split by whether they need a power-off first.
#[derive(Debug, Default)]
pub struct VmCandidates {
    pub power_off_and_destroy: Vec<InventoryObject>,
    pub destroy: Vec<InventoryObject>,
    /// Paths of VMs that could not be judged for lack of runtime properties.
    pub unreadable: Vec<String>,
}

impl VmCandidates {
    /// Split `vms` into candidates. Templates and VMs created after
    /// `cutoff` are left alone.
    pub fn select(vms: Vec<InventoryObject>, cutoff: Option<DateTime<Utc>>) -> Self {
        let mut candidates = Self::default();

        for vm in vms {
            let Some(runtime) = &vm.vm else {
                warn!(path = %vm.path, "VM has no runtime properties");
                candidates.unreadable.push(vm.path);
                continue;
            };
            if runtime.template {
                continue;
            }
            if let (Some(cutoff), Some(created)) = (cutoff, runtime.created_at) {
                if created > cutoff {
                    debug!(vm = %runtime.name, created = %created, "Skipping VM created after cutoff");
                    continue;
                }
            }

            if runtime.power_state == PowerState::PoweredOn {
                candidates.power_off_and_destroy.push(vm);
            } else {
                candidates.destroy.push(vm);
            }
        }

        candidates
    }

    pub fn len(&self) -> usize {
        self.power_off_and_destroy.len() + self.destroy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Running VMs first, then the rest.
    pub fn all(&self) -> impl Iterator<Item = &InventoryObject> {
        self.power_off_and_destroy.iter().chain(self.destroy.iter())
    }
}

/// Destroys every stale, non-template VM below a folder.
pub struct VmReaper {
    inventory: Arc<dyn Inventory>,
    lister: Lister,
    config: Arc<ReaperConfig>,
    audit: Arc<ReapAuditLogger>,
    cancel: CancellationToken,
}

impl VmReaper {
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

    /// Reap the VMs below `folder`.
    ///
    /// Power-off failures are logged and ignored; the destroy that follows
    /// reports the VMs that really could not be removed.
    pub async fn reap(&self, folder: &str) -> Result<()> {
        if folder.is_empty() {
            return Err(ReapError::InvalidInput(
                "cannot use empty string as folder".to_string(),
            ));
        }

        info!(folder = %folder, "Deleting VMs in folder");

        let vms = self
            .lister
            .list(folder, &[ObjectKind::VirtualMachine])
            .await?;
        if vms.is_empty() {
            return Ok(());
        }

        let candidates = VmCandidates::select(vms, self.config.cutoff());
        let mut errors: Vec<ReapError> = candidates
            .unreadable
            .iter()
            .cloned()
            .map(ReapError::MissingProperties)
            .collect();

        if !candidates.is_empty() {
            self.power_off(&candidates).await?;
            if let Err(e) = self.destroy(&candidates).await {
                if e.is_cancelled() {
                    return Err(e);
                }
                errors.push(e);
            }
        }

        aggregate(errors)
    }

    async fn power_off(&self, candidates: &VmCandidates) -> Result<()> {
        let mut tasks = Vec::new();

        for vm in &candidates.power_off_and_destroy {
            if self.cancel.is_cancelled() {
                return Err(ReapError::Cancelled);
            }
            let name = vm.name();
            info!(vm = %name, "Powering off VM");
            self.audit.power_off_vm(&vm.reference.id, name);
            if self.config.dry_run {
                continue;
            }

            match self.inventory.power_off(&vm.reference).await {
                Ok(task) => {
                    info!(vm = %name, task = %task, "Created PowerOff task for VM");
                    tasks.push(PendingTask::new(task, name).ignoring_errors());
                }
                Err(e) => info!(vm = %name, error = %e, "Ignoring error creating PowerOff task"),
            }
        }

        // The VM may already be powering off. A VM that really failed to
        // power off surfaces in the destroy below.
        wait_for_tasks(self.inventory.as_ref(), tasks, &self.cancel).await
    }

    async fn destroy(&self, candidates: &VmCandidates) -> Result<()> {
        let mut tasks = Vec::new();
        let mut errors = Vec::new();

        for vm in candidates.all() {
            if self.cancel.is_cancelled() {
                return Err(ReapError::Cancelled);
            }
            let name = vm.name();
            info!(vm = %name, "Destroying VM");
            self.audit.destroy_vm(&vm.reference.id, name);
            if self.config.dry_run {
                continue;
            }

            match self.inventory.destroy(&vm.reference).await {
                Ok(task) => {
                    info!(vm = %name, task = %task, "Created Destroy task for VM");
                    tasks.push(PendingTask::new(task, name));
                }
                Err(e) => errors.push(e.context(format!("creating Destroy task for VM {}", name))),
            }
        }

        let waited = wait_for_tasks(self.inventory.as_ref(), tasks, &self.cancel)
            .await
            .context("waiting for VM destroy tasks to finish");
        if let Err(e) = waited {
            if e.is_cancelled() {
                return Err(e);
            }
            errors.push(e);
        }

        aggregate(errors)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::audit::create_audit_logger;
    use crate::memory::{MemoryPlatform, Mutation, Seed};

    fn reaper(platform: &Arc<MemoryPlatform>, config: ReaperConfig) -> VmReaper {
        let dry_run = config.dry_run;
        VmReaper::new(
            platform.clone(),
            Arc::new(config),
            create_audit_logger("vms", dry_run),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_powers_off_then_destroys_stale_vm() {
        let now = Utc::now();
        let platform = Arc::new(MemoryPlatform::new());
        platform.seed(&[
            Seed::folder("/DC0/vm/F"),
            Seed::vm("/DC0/vm/F/v1")
                .powered_on()
                .created_at(now - Duration::hours(24)),
        ]);
        let config = ReaperConfig {
            now: Some(now),
            ..Default::default()
        }
        .max_age(Duration::hours(12));

        reaper(&platform, config).reap("/DC0/vm/F").await.unwrap();

        assert_eq!(
            platform.mutations(),
            vec![
                Mutation::PowerOff("/DC0/vm/F/v1".into()),
                Mutation::Destroy("/DC0/vm/F/v1".into()),
            ]
        );
        assert!(platform.paths_below("/DC0/vm/F").is_empty());
    }

    #[tokio::test]
    async fn test_keeps_vm_created_after_cutoff() {
        let now = Utc::now();
        let platform = Arc::new(MemoryPlatform::new());
        platform.seed(&[
            Seed::folder("/DC0/vm/F"),
            Seed::vm("/DC0/vm/F/v1")
                .powered_on()
                .created_at(now - Duration::hours(1)),
        ]);
        let config = ReaperConfig {
            now: Some(now),
            ..Default::default()
        }
        .max_age(Duration::hours(12));

        reaper(&platform, config).reap("/DC0/vm/F").await.unwrap();

        assert!(platform.mutations().is_empty());
        assert_eq!(platform.paths_below("/DC0/vm/F"), vec!["/DC0/vm/F/v1"]);
    }

    #[tokio::test]
    async fn test_templates_are_never_candidates() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.seed(&[
            Seed::folder("/DC0/vm/F"),
            Seed::vm("/DC0/vm/F/tpl").template(),
            Seed::vm("/DC0/vm/F/sub/off"),
        ]);

        reaper(&platform, ReaperConfig::default())
            .reap("/DC0/vm/F")
            .await
            .unwrap();

        assert_eq!(
            platform.mutations(),
            vec![Mutation::Destroy("/DC0/vm/F/sub/off".into())]
        );
        assert!(platform.exists("/DC0/vm/F/tpl"));
    }

    #[tokio::test]
    async fn test_power_off_failure_does_not_block_destroy() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.seed(&[Seed::folder("/DC0/vm/F"), Seed::vm("/DC0/vm/F/v1").powered_on()]);
        platform.fail_power_off("/DC0/vm/F/v1");

        reaper(&platform, ReaperConfig::default())
            .reap("/DC0/vm/F")
            .await
            .unwrap();

        assert!(!platform.exists("/DC0/vm/F/v1"));
    }

    #[tokio::test]
    async fn test_destroy_failure_is_propagated() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.seed(&[
            Seed::folder("/DC0/vm/F"),
            Seed::vm("/DC0/vm/F/stuck"),
            Seed::vm("/DC0/vm/F/fine"),
        ]);
        platform.fail_destroy("/DC0/vm/F/stuck");

        let err = reaper(&platform, ReaperConfig::default())
            .reap("/DC0/vm/F")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("stuck"), "{err}");
        assert!(platform.exists("/DC0/vm/F/stuck"));
        assert!(!platform.exists("/DC0/vm/F/fine"));
    }

    #[tokio::test]
    async fn test_dry_run_issues_no_mutation() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.seed(&[Seed::folder("/DC0/vm/F"), Seed::vm("/DC0/vm/F/v1").powered_on()]);
        let before = platform.snapshot();

        reaper(&platform, ReaperConfig::default().dry_run(true))
            .reap("/DC0/vm/F")
            .await
            .unwrap();

        assert!(platform.mutations().is_empty());
        assert_eq!(platform.snapshot(), before);
    }

    #[tokio::test]
    async fn test_empty_folder_path_fails_fast() {
        let platform = Arc::new(MemoryPlatform::new());
        let err = reaper(&platform, ReaperConfig::default())
            .reap("")
            .await
            .unwrap_err();
        assert!(matches!(err, ReapError::InvalidInput(_)));
        assert_eq!(platform.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_vms_is_a_no_op() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.seed(&[Seed::folder("/DC0/vm/F"), Seed::folder("/DC0/vm/F/a")]);

        reaper(&platform, ReaperConfig::default())
            .reap("/DC0/vm/F")
            .await
            .unwrap();
        assert!(platform.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_vm_without_runtime_properties_is_reported() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.seed(&[
            Seed::folder("/DC0/vm/F"),
            Seed::vm("/DC0/vm/F/partial").without_runtime(),
            Seed::vm("/DC0/vm/F/fine"),
        ]);

        let err = reaper(&platform, ReaperConfig::default())
            .reap("/DC0/vm/F")
            .await
            .unwrap_err();

        let ReapError::Aggregate(agg) = &err else {
            panic!("expected aggregate, got {err:?}");
        };
        assert!(matches!(
            agg.errors(),
            [ReapError::MissingProperties(path)] if path == "/DC0/vm/F/partial"
        ));
        assert!(platform.exists("/DC0/vm/F/partial"));
        assert!(!platform.exists("/DC0/vm/F/fine"));
    }
}
