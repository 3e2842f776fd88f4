//! Recursive inventory listing through temporary container views.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ReapError, Result};
use crate::inventory::{Inventory, InventoryObject, ObjectKind, ObjectRef, ViewRef};

/// Name pattern matching every object in a view.
const MATCH_ALL: &str = "*";

/// Lists the descendants of an inventory path.
#[derive(Clone)]
pub struct Lister {
    inventory: Arc<dyn Inventory>,
}

impl Lister {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self { inventory }
    }

    /// List every descendant of `root_path`, optionally restricted to `kinds`.
    ///
    /// The root itself is not part of the result. Order is unspecified.
    pub async fn list(&self, root_path: &str, kinds: &[ObjectKind]) -> Result<Vec<InventoryObject>> {
        let root = self.resolve_one(root_path).await?;

        let view = self
            .inventory
            .create_container_view(&root, kinds, true)
            .await?;
        let listed = self.list_view(&view).await;

        // The view must go on every path, including failed listings.
        if let Err(e) = self.inventory.destroy_view(&view).await {
            warn!(view = %view.id, error = %e, "Failed to destroy container view");
        }

        let objects = listed?;
        debug!(root = %root_path, kinds = ?kinds, count = objects.len(), "Listed inventory objects");
        Ok(objects)
    }

    /// Resolve `path` to exactly one object.
    pub async fn resolve_one(&self, path: &str) -> Result<ObjectRef> {
        let mut found = self.inventory.resolve(path).await?;
        match found.len() {
            0 => Err(ReapError::NotFound(format!("no object at inventory path {}", path))),
            1 => Ok(found.remove(0)),
            count => Err(ReapError::Ambiguous {
                path: path.to_string(),
                count,
            }),
        }
    }

    async fn list_view(&self, view: &ViewRef) -> Result<Vec<InventoryObject>> {
        let refs = self.inventory.find_in_view(view, MATCH_ALL).await?;
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        // One batched fetch for all found objects.
        self.inventory.retrieve(&refs).await
    }
}
