//! Cleanup orchestrator - runs the reapers as one ordered pass.
//!
//! Phases run strictly one after another. Errors of a phase are collected
//! across all of its inputs, and a failed phase ends the pass: containers
//! are only pruned once their VMs are gone.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::create_audit_logger;
use crate::config::{CleanupPlan, ReaperConfig};
use crate::error::{ReapError, Result, ResultExt, aggregate};
use crate::inventory::{Inventory, ObjectKind};
use crate::module::{ClusterModules, ModuleReaper};
use crate::pruner::ContainerPruner;
use crate::vm::VmReaper;
use crate::volume::{VolumeCatalog, VolumeReaper};

/// The whole cleanup engine, wired to one platform.
pub struct Reaper {
    config: Arc<ReaperConfig>,
    cancel: CancellationToken,
    vms: VmReaper,
    containers: ContainerPruner,
    volumes: VolumeReaper,
    modules: ModuleReaper,
}

impl Reaper {
    pub fn new(
        config: ReaperConfig,
        inventory: Arc<dyn Inventory>,
        volumes: Arc<dyn VolumeCatalog>,
        modules: Arc<dyn ClusterModules>,
        cancel: CancellationToken,
    ) -> Self {
        let config = Arc::new(config);
        let dry_run = config.dry_run;

        Self {
            vms: VmReaper::new(
                Arc::clone(&inventory),
                Arc::clone(&config),
                create_audit_logger("vms", dry_run),
                cancel.clone(),
            ),
            containers: ContainerPruner::new(
                Arc::clone(&inventory),
                Arc::clone(&config),
                create_audit_logger("containers", dry_run),
                cancel.clone(),
            ),
            volumes: VolumeReaper::new(
                volumes,
                inventory,
                Arc::clone(&config),
                create_audit_logger("volumes", dry_run),
                cancel.clone(),
            ),
            modules: ModuleReaper::new(
                modules,
                Arc::clone(&config),
                create_audit_logger("cluster-modules", dry_run),
                cancel.clone(),
            ),
            config,
            cancel,
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Run one pass over `plan`.
    pub async fn cleanup(&self, plan: &CleanupPlan) -> Result<()> {
        if self.config.dry_run {
            info!("Dry run: no object will be changed");
        }

        self.check_cancelled()?;
        info!(folders = ?plan.vm_folders, "Cleaning up VMs");
        let mut errors = Vec::new();
        for folder in &plan.vm_folders {
            self.check_cancelled()?;
            let result = self
                .vms
                .reap(folder)
                .await
                .with_context(|| format!("cleaning up VMs in folder {:?}", folder));
            record(&mut errors, result)?;
        }
        finish_phase(errors, "cleaning up VMs")?;

        self.check_cancelled()?;
        info!(pools = ?plan.resource_pools, "Cleaning up resource pools");
        let mut errors = Vec::new();
        for pool in &plan.resource_pools {
            self.check_cancelled()?;
            let result = self
                .containers
                .prune(pool, ObjectKind::ResourcePool)
                .await
                .with_context(|| format!("cleaning up resource pool {:?}", pool));
            record(&mut errors, result)?;
        }
        finish_phase(errors, "cleaning up resource pools")?;

        self.check_cancelled()?;
        info!(folders = ?plan.folders, "Cleaning up folders");
        let mut errors = Vec::new();
        for folder in &plan.folders {
            self.check_cancelled()?;
            let result = self
                .containers
                .prune(folder, ObjectKind::Folder)
                .await
                .with_context(|| format!("cleaning up folder {:?}", folder));
            record(&mut errors, result)?;
        }
        finish_phase(errors, "cleaning up folders")?;

        if let Some(owner) = &plan.owner_label {
            self.check_cancelled()?;
            info!(owner = %owner, "Cleaning up volumes");
            self.volumes.reap(owner).await.context("cleaning up volumes")?;
        }

        if plan.skip_grouping_objects {
            info!("Skipping cluster module cleanup");
        } else {
            self.check_cancelled()?;
            info!("Cleaning up cluster modules");
            self.modules.reap().await.context("cleaning up cluster modules")?;
        }

        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ReapError::Cancelled);
        }
        Ok(())
    }
}

/// Keep a per-input failure for the phase. Cancellation ends the pass at once.
fn record(errors: &mut Vec<ReapError>, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            warn!(error = %e, "Cleanup step failed");
            errors.push(e);
            Ok(())
        }
    }
}

fn finish_phase(errors: Vec<ReapError>, phase: &str) -> Result<()> {
    aggregate(errors).context(phase)
}
