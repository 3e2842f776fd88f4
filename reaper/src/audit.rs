//! Reaper-specific audit logging
//!
//! Every mutation the reaper issues, or would issue in dry-run, is
//! recorded as an event on the `audit` target before it is issued.

use std::sync::Arc;

use tracing::info;

/// Audit logger with reaper-specific methods
pub struct ReapAuditLogger {
    component: String,
    dry_run: bool,
}

impl ReapAuditLogger {
    pub fn new(component: &str, dry_run: bool) -> Self {
        Self {
            component: component.to_string(),
            dry_run,
        }
    }

    fn log(&self, message: String, object_ids: Vec<String>) {
        info!(
            target: "audit",
            component = %self.component,
            dry_run = self.dry_run,
            objects = ?object_ids,
            "{}",
            message
        );
    }

    // === Inventory Events ===

    pub fn power_off_vm(&self, vm_id: &str, vm_name: &str) {
        self.log(format!("Powering off VM '{}'", vm_name), vec![vm_id.to_string()]);
    }

    pub fn destroy_vm(&self, vm_id: &str, vm_name: &str) {
        self.log(format!("Destroying VM '{}'", vm_name), vec![vm_id.to_string()]);
    }

    pub fn destroy_container(&self, kind: &str, object_id: &str, path: &str) {
        self.log(
            format!("Destroying {} '{}'", kind, path),
            vec![object_id.to_string()],
        );
    }

    pub fn mark_container(&self, kind: &str, object_id: &str, path: &str, timestamp: &str) {
        self.log(
            format!("Marking {} '{}' for deletion at {}", kind, path, timestamp),
            vec![object_id.to_string()],
        );
    }

    // === Volume Events ===

    pub fn delete_volume(&self, volume_id: &str, claim: &str) {
        self.log(
            format!("Deleting volume of claim '{}'", claim),
            vec![volume_id.to_string()],
        );
    }

    // === Cluster Module Events ===

    pub fn delete_cluster_module(&self, module_id: &str) {
        self.log(
            "Deleting empty cluster module".to_string(),
            vec![module_id.to_string()],
        );
    }
}

/// Create a shared audit logger
pub fn create_audit_logger(component: &str, dry_run: bool) -> Arc<ReapAuditLogger> {
    Arc::new(ReapAuditLogger::new(component, dry_run))
}
