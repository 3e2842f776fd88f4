//! Reaper configuration.

use chrono::{DateTime, Duration, Utc};

/// Label key that ties a volume to the lease resource that created it.
pub const DEFAULT_OWNER_LABEL_KEY: &str = "e2e-test-lease-resource";

/// Custom field used as first-seen timestamp on folders and resource pools.
pub const DEFAULT_DELETION_MARKER: &str = "reaper-deletion-marker";

/// Settings for one reaper instance.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Perform every read and decision but no mutation.
    pub dry_run: bool,
    /// Only reclaim objects older than this. `None` reclaims everything.
    pub max_age: Option<Duration>,
    pub owner_label_key: String,
    pub deletion_marker: String,
    /// Fixed reference time; the wall clock when unset.
    pub now: Option<DateTime<Utc>>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_age: None,
            owner_label_key: DEFAULT_OWNER_LABEL_KEY.to_string(),
            deletion_marker: DEFAULT_DELETION_MARKER.to_string(),
            now: None,
        }
    }
}

impl ReaperConfig {
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    /// Objects created after the cutoff are left alone.
    pub fn cutoff(&self) -> Option<DateTime<Utc>> {
        self.max_age.map(|age| self.now() - age)
    }
}

/// Inputs of one cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupPlan {
    /// Folders whose empty sub-folders are pruned.
    pub folders: Vec<String>,
    /// Resource pools whose empty child pools are pruned.
    pub resource_pools: Vec<String>,
    /// Folders whose VMs are destroyed.
    pub vm_folders: Vec<String>,
    /// Owner label value of volumes to delete. No volumes are touched when unset.
    pub owner_label: Option<String>,
    pub skip_grouping_objects: bool,
}
