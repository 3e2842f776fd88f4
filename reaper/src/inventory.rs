//! Inventory model and the platform seam the reaper drives.
//!
//! The platform exposes a hierarchical inventory of folders, resource
//! pools and virtual machines. Mutations are asynchronous: they return a
//! [`TaskRef`] that has to be awaited through [`Inventory::wait_task`].

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReapError, Result};

/// Path separator of inventory paths.
pub const PATH_SEPARATOR: char = '/';

/// Type of an inventory object.
///
/// Kinds the platform reports that the reaper does not know about are
/// kept as `Other` so occupancy checks still see them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ObjectKind {
    VirtualMachine,
    Folder,
    ResourcePool,
    Other(String),
}

impl ObjectKind {
    pub fn as_str(&self) -> &str {
        match self {
            ObjectKind::VirtualMachine => "VirtualMachine",
            ObjectKind::Folder => "Folder",
            ObjectKind::ResourcePool => "ResourcePool",
            ObjectKind::Other(name) => name,
        }
    }
}

impl From<String> for ObjectKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "VirtualMachine" => ObjectKind::VirtualMachine,
            "Folder" => ObjectKind::Folder,
            "ResourcePool" => ObjectKind::ResourcePool,
            _ => ObjectKind::Other(s),
        }
    }
}

impl From<&str> for ObjectKind {
    fn from(s: &str) -> Self {
        ObjectKind::from(s.to_string())
    }
}

impl From<ObjectKind> for String {
    fn from(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two kinds of container whose empty descendants can be pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Folder,
    ResourcePool,
}

impl From<ContainerKind> for ObjectKind {
    fn from(kind: ContainerKind) -> Self {
        match kind {
            ContainerKind::Folder => ObjectKind::Folder,
            ContainerKind::ResourcePool => ObjectKind::ResourcePool,
        }
    }
}

impl TryFrom<ObjectKind> for ContainerKind {
    type Error = ReapError;

    fn try_from(kind: ObjectKind) -> Result<Self> {
        match kind {
            ObjectKind::Folder => Ok(ContainerKind::Folder),
            ObjectKind::ResourcePool => Ok(ContainerKind::ResourcePool),
            other @ (ObjectKind::VirtualMachine | ObjectKind::Other(_)) => {
                Err(ReapError::Unsupported(other))
            }
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&ObjectKind::from(*self), f)
    }
}

/// Reference to a remote inventory object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Handle to a temporary container view on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRef {
    pub id: String,
}

/// Handle to an asynchronous platform task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// VM power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// VM-specific properties fetched alongside the object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRuntime {
    pub name: String,
    pub power_state: PowerState,
    #[serde(default)]
    pub template: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Custom field value attached to an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldValue {
    pub key: i32,
    pub value: String,
}

/// An inventory object together with the properties the reaper decides on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryObject {
    pub reference: ObjectRef,
    /// Absolute inventory path, unique within the inventory.
    pub path: String,
    #[serde(default)]
    pub custom_values: Vec<CustomFieldValue>,
    /// Present for virtual machines only.
    #[serde(default)]
    pub vm: Option<VmRuntime>,
}

impl InventoryObject {
    pub fn kind(&self) -> &ObjectKind {
        &self.reference.kind
    }

    /// Display name: the VM name when known, the last path element otherwise.
    pub fn name(&self) -> &str {
        if let Some(vm) = &self.vm {
            return &vm.name;
        }
        self.path
            .rsplit(PATH_SEPARATOR)
            .next()
            .unwrap_or(&self.path)
    }

    /// Nesting depth, counted as path separators.
    pub fn depth(&self) -> usize {
        path_depth(&self.path)
    }

    pub fn custom_value(&self, key: i32) -> Option<&str> {
        self.custom_values
            .iter()
            .find(|v| v.key == key)
            .map(|v| v.value.as_str())
    }
}

pub fn path_depth(path: &str) -> usize {
    path.matches(PATH_SEPARATOR).count()
}

/// Inventory primitives of the virtualization platform.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Resolve an inventory path to every object it matches.
    async fn resolve(&self, path: &str) -> Result<Vec<ObjectRef>>;

    /// Create a container view over the descendants of `root`.
    ///
    /// An empty `kinds` slice selects every kind.
    async fn create_container_view(
        &self,
        root: &ObjectRef,
        kinds: &[ObjectKind],
        recursive: bool,
    ) -> Result<ViewRef>;

    /// Objects in the view whose name matches `name_pattern`.
    async fn find_in_view(&self, view: &ViewRef, name_pattern: &str) -> Result<Vec<ObjectRef>>;

    /// Release a container view.
    async fn destroy_view(&self, view: &ViewRef) -> Result<()>;

    /// Batched property fetch.
    async fn retrieve(&self, refs: &[ObjectRef]) -> Result<Vec<InventoryObject>>;

    async fn power_off(&self, vm: &ObjectRef) -> Result<TaskRef>;

    async fn destroy(&self, object: &ObjectRef) -> Result<TaskRef>;

    /// Block until the task finishes. A failed task returns its error.
    async fn wait_task(&self, task: &TaskRef) -> Result<()>;

    /// Key of the custom field definition named `name`, if it exists.
    async fn find_custom_field(&self, name: &str) -> Result<Option<i32>>;

    async fn add_custom_field(&self, name: &str) -> Result<i32>;

    async fn set_custom_field(&self, object: &ObjectRef, key: i32, value: &str) -> Result<()>;
}
