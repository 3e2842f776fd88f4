//! Lease-driven cleanup: clean every dirty resource the broker hands out.

use reaper_lease::{LeaseClient, Resource, ResourceState};
use tracing::{Instrument, info, info_span};

use crate::cleanup::Reaper;
use crate::config::CleanupPlan;
use crate::error::{ReapError, Result, ResultExt, aggregate};

pub const FOLDER_KEY: &str = "folder";
pub const RESOURCE_POOL_KEY: &str = "resourcePool";

/// Cleanup inputs stored in a resource's user data.
pub fn plan_for(resource: &Resource) -> Result<CleanupPlan> {
    let data = resource.user_data.as_ref().ok_or_else(|| {
        ReapError::InvalidInput(format!("resource {:?} is missing user data", resource.name))
    })?;
    let lookup = |key: &str| {
        data.get(key).map(str::to_string).ok_or_else(|| {
            ReapError::InvalidInput(format!(
                "resource {:?} is missing {:?} key",
                resource.name, key
            ))
        })
    };

    let folder = lookup(FOLDER_KEY)?;
    let resource_pool = lookup(RESOURCE_POOL_KEY)?;

    Ok(CleanupPlan {
        folders: vec![folder.clone()],
        resource_pools: vec![resource_pool],
        vm_folders: vec![folder],
        owner_label: Some(resource.name.clone()),
        skip_grouping_objects: false,
    })
}

/// Drives a [`Reaper`] from the lease broker.
pub struct LeaseRunner {
    client: LeaseClient,
    reaper: Reaper,
}

impl LeaseRunner {
    pub fn new(client: LeaseClient, reaper: Reaper) -> Self {
        Self { client, reaper }
    }

    /// Clean all dirty resources of every type.
    ///
    /// A resource is released as free only after a successful cleanup. A
    /// failed one stays in cleaning until the broker's own reaper turns it
    /// dirty again.
    pub async fn run(&self, resource_types: &[String]) -> Result<()> {
        let mut errors = Vec::new();

        for resource_type in resource_types {
            let span = info_span!("resource_type", resource_type = %resource_type);
            self.run_type(resource_type, &mut errors)
                .instrument(span)
                .await?;
        }

        aggregate(errors).context("cleaning up leased resources")
    }

    async fn run_type(&self, resource_type: &str, errors: &mut Vec<ReapError>) -> Result<()> {
        self.log_metric(resource_type, "before", errors).await;

        loop {
            info!("Acquiring resource");
            let resource = match self
                .client
                .acquire(resource_type, ResourceState::Dirty, ResourceState::Cleaning)
                .await
            {
                Ok(resource) => resource,
                Err(e) if e.is_not_found() => {
                    info!("No more resources to clean up");
                    break;
                }
                Err(e) => {
                    errors.push(ReapError::from(e).context("acquiring resource"));
                    break;
                }
            };

            let plan = match plan_for(&resource) {
                Ok(plan) => plan,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };

            info!(resource = %resource.name, "Cleaning up resource");
            if let Err(e) = self.reaper.cleanup(&plan).await {
                if e.is_cancelled() {
                    return Err(e);
                }
                info!(resource = %resource.name, "Cleanup failed, resource stays in cleaning");
                errors.push(e.context(format!(
                    "cleaning up resource {:?} failed, it will now become stale",
                    resource.name
                )));
                continue;
            }

            info!(resource = %resource.name, "Releasing resource as free");
            if let Err(e) = self.client.release(&resource.name, ResourceState::Free).await {
                errors.push(ReapError::from(e).context(format!(
                    "releasing resource {:?} as free failed, it will now become stale",
                    resource.name
                )));
            }
        }

        self.log_metric(resource_type, "after", errors).await;
        Ok(())
    }

    async fn log_metric(&self, resource_type: &str, when: &str, errors: &mut Vec<ReapError>) {
        match self.client.metric(resource_type).await {
            Ok(metric) => info!(
                when = %when,
                states = ?metric.current,
                owners = ?metric.owners,
                "Resource states"
            ),
            Err(e) => errors.push(ReapError::from(e).context(format!(
                "getting metrics {} cleanup for resource type {:?}",
                when, resource_type
            ))),
        }
    }
}
