//! In-memory platform.
//!
//! Implements every platform seam over a local inventory tree, volume
//! catalog and cluster module store. Mutations are applied when they are
//! issued and recorded in issue order; the returned task reports the
//! outcome. Faults can be injected per object.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ReapError, Result};
use crate::inventory::{
    CustomFieldValue, Inventory, InventoryObject, ObjectKind, ObjectRef, PATH_SEPARATOR,
    PowerState, TaskRef, ViewRef, VmRuntime,
};
use crate::module::{ClusterModule, ClusterModules};
use crate::volume::{Cursor, QueryFilter, Volume, VolumeCatalog, VolumePage};

const DEFAULT_PAGE_SIZE: usize = 100;
const FIRST_FIELD_KEY: i32 = 100;

/// A mutating call, as issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    PowerOff(String),
    Destroy(String),
    AddCustomField(String),
    SetCustomField(String, String),
    DeleteVolume(String),
    DeleteModule(String),
}

/// Object to place into the inventory.
#[derive(Debug, Clone)]
pub struct Seed {
    path: String,
    kind: ObjectKind,
    power_state: PowerState,
    template: bool,
    created_at: Option<DateTime<Utc>>,
    runtime: bool,
}

impl Seed {
    fn new(path: &str, kind: ObjectKind) -> Self {
        Self {
            path: path.to_string(),
            kind,
            power_state: PowerState::PoweredOff,
            template: false,
            created_at: None,
            runtime: true,
        }
    }

    pub fn folder(path: &str) -> Self {
        Self::new(path, ObjectKind::Folder)
    }

    pub fn resource_pool(path: &str) -> Self {
        Self::new(path, ObjectKind::ResourcePool)
    }

    /// A powered-off VM without creation date.
    pub fn vm(path: &str) -> Self {
        Self::new(path, ObjectKind::VirtualMachine)
    }

    pub fn other(path: &str, kind: &str) -> Self {
        Self::new(path, ObjectKind::from(kind))
    }

    pub fn powered_on(mut self) -> Self {
        self.power_state = PowerState::PoweredOn;
        self
    }

    pub fn template(mut self) -> Self {
        self.template = true;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// A VM whose property fetch comes back without runtime properties.
    pub fn without_runtime(mut self) -> Self {
        self.runtime = false;
        self
    }
}

/// Comparable copy of everything the platform holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    objects: BTreeMap<String, InventoryObject>,
    fields: BTreeMap<String, i32>,
    volumes: Vec<Volume>,
    modules: BTreeMap<String, ModuleEntry>,
}

#[derive(Debug, Clone, PartialEq)]
struct ModuleEntry {
    module: ClusterModule,
    members: Vec<ObjectRef>,
}

#[derive(Debug, Clone)]
struct View {
    root: String,
    kinds: Vec<ObjectKind>,
    recursive: bool,
}

#[derive(Debug, Default)]
struct Faults {
    retrieve: bool,
    power_off: HashSet<String>,
    destroy: HashSet<String>,
    reject_destroy: HashSet<String>,
    members: HashSet<String>,
    hang_tasks: bool,
}

#[derive(Debug, Default)]
struct State {
    /// Keyed by path.
    objects: BTreeMap<String, InventoryObject>,
    next_id: u64,
    fields: BTreeMap<String, i32>,
    views: HashMap<String, View>,
    tasks: HashMap<String, std::result::Result<(), String>>,
    awaited: Vec<String>,
    mutations: Vec<Mutation>,
    calls: usize,
    volumes: Vec<Volume>,
    volume_queries: usize,
    page_size: Option<usize>,
    loose_labels: bool,
    modules: BTreeMap<String, ModuleEntry>,
    faults: Faults,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn insert(&mut self, seed: &Seed) {
        for ancestor in ancestors(&seed.path) {
            if !self.objects.contains_key(ancestor) {
                self.insert(&Seed::folder(ancestor));
            }
        }

        let prefix = match &seed.kind {
            ObjectKind::VirtualMachine => "vm",
            ObjectKind::Folder => "group",
            ObjectKind::ResourcePool => "resgroup",
            ObjectKind::Other(_) => "obj",
        };
        let id = self.next_id(prefix);
        let vm = (seed.kind == ObjectKind::VirtualMachine && seed.runtime).then(|| VmRuntime {
            name: last_segment(&seed.path).to_string(),
            power_state: seed.power_state,
            template: seed.template,
            created_at: seed.created_at,
        });

        self.objects.insert(
            seed.path.clone(),
            InventoryObject {
                reference: ObjectRef::new(seed.kind.clone(), id),
                path: seed.path.clone(),
                custom_values: Vec::new(),
                vm,
            },
        );
    }

    fn path_of(&self, reference: &ObjectRef) -> Option<String> {
        self.objects
            .values()
            .find(|o| &o.reference == reference)
            .map(|o| o.path.clone())
    }

    fn require_path(&self, reference: &ObjectRef) -> Result<String> {
        self.path_of(reference)
            .ok_or_else(|| ReapError::NotFound(format!("object {}", reference)))
    }

    fn has_children(&self, path: &str) -> bool {
        self.objects.keys().any(|p| is_below(p, path, true))
    }

    fn task(&mut self, outcome: std::result::Result<(), String>) -> TaskRef {
        let id = self.next_id("task");
        self.tasks.insert(id.clone(), outcome);
        TaskRef { id }
    }

    fn ensure_field(&mut self, name: &str) -> i32 {
        if let Some(key) = self.fields.get(name) {
            return *key;
        }
        let key = FIRST_FIELD_KEY + self.fields.len() as i32;
        self.fields.insert(name.to_string(), key);
        key
    }
}

/// Deterministic in-memory platform.
#[derive(Debug, Default)]
pub struct MemoryPlatform {
    state: Mutex<State>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed objects. Missing ancestors are created as folders.
    pub fn seed(&self, seeds: &[Seed]) {
        let mut state = self.state();
        for seed in seeds {
            state.insert(seed);
        }
    }

    pub fn add_volumes(&self, volumes: Vec<Volume>) {
        self.state().volumes.extend(volumes);
    }

    /// Add a cluster module whose members are VMs with the given ids.
    pub fn add_module(&self, id: &str, cluster: &str, members: &[&str]) {
        let entry = ModuleEntry {
            module: ClusterModule {
                id: id.to_string(),
                cluster: cluster.to_string(),
            },
            members: members
                .iter()
                .map(|m| ObjectRef::new(ObjectKind::VirtualMachine, *m))
                .collect(),
        };
        self.state().modules.insert(id.to_string(), entry);
    }

    /// Write a custom field value directly, creating the field if needed.
    pub fn set_marker(&self, path: &str, field: &str, value: &str) {
        let mut state = self.state();
        let key = state.ensure_field(field);
        if let Some(object) = state.objects.get_mut(path) {
            set_value(object, key, value);
        }
    }

    // === Fault injection ===

    pub fn fail_retrieve(&self, fail: bool) {
        self.state().faults.retrieve = fail;
    }

    pub fn fail_power_off(&self, path: &str) {
        self.state().faults.power_off.insert(path.to_string());
    }

    pub fn fail_destroy(&self, path: &str) {
        self.state().faults.destroy.insert(path.to_string());
    }

    /// Destroy calls on `path` are refused before any task is created.
    pub fn reject_destroy(&self, path: &str) {
        self.state().faults.reject_destroy.insert(path.to_string());
    }

    pub fn fail_members(&self, module_id: &str) {
        self.state().faults.members.insert(module_id.to_string());
    }

    /// Task waits never finish.
    pub fn hang_tasks(&self, hang: bool) {
        self.state().faults.hang_tasks = hang;
    }

    /// Match volume labels on substrings in either direction, like a
    /// catalog with a sloppy filter.
    pub fn loose_label_query(&self, loose: bool) {
        self.state().loose_labels = loose;
    }

    pub fn page_size(&self, size: usize) {
        self.state().page_size = Some(size.max(1));
    }

    // === Inspection ===

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state().mutations.clone()
    }

    /// Number of trait calls made so far.
    pub fn calls(&self) -> usize {
        self.state().calls
    }

    pub fn reference(&self, path: &str) -> Option<ObjectRef> {
        self.state().objects.get(path).map(|o| o.reference.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state().objects.contains_key(path)
    }

    /// Sorted paths of every descendant of `root`.
    pub fn paths_below(&self, root: &str) -> Vec<String> {
        self.state()
            .objects
            .keys()
            .filter(|p| is_below(p, root, true))
            .cloned()
            .collect()
    }

    pub fn custom_value(&self, path: &str, field: &str) -> Option<String> {
        let state = self.state();
        let key = *state.fields.get(field)?;
        state
            .objects
            .get(path)?
            .custom_value(key)
            .map(str::to_string)
    }

    pub fn open_views(&self) -> usize {
        self.state().views.len()
    }

    pub fn awaited_tasks(&self) -> usize {
        self.state().awaited.len()
    }

    pub fn was_awaited(&self, task: &TaskRef) -> bool {
        self.state().awaited.contains(&task.id)
    }

    pub fn volume_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().volumes.iter().map(|v| v.id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn volume_queries(&self) -> usize {
        self.state().volume_queries
    }

    pub fn module_ids(&self) -> Vec<String> {
        self.state().modules.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state();
        Snapshot {
            objects: state.objects.clone(),
            fields: state.fields.clone(),
            volumes: state.volumes.clone(),
            modules: state.modules.clone(),
        }
    }

    /// Lock the state and count one trait call.
    fn call(&self) -> MutexGuard<'_, State> {
        let mut state = self.state();
        state.calls += 1;
        state
    }
}

#[async_trait]
impl Inventory for MemoryPlatform {
    async fn resolve(&self, path: &str) -> Result<Vec<ObjectRef>> {
        let state = self.call();
        Ok(state
            .objects
            .values()
            .filter(|o| path_matches(path, &o.path))
            .map(|o| o.reference.clone())
            .collect())
    }

    async fn create_container_view(
        &self,
        root: &ObjectRef,
        kinds: &[ObjectKind],
        recursive: bool,
    ) -> Result<ViewRef> {
        let mut state = self.call();
        let root = state.require_path(root)?;
        let id = state.next_id("session");
        state.views.insert(
            id.clone(),
            View {
                root,
                kinds: kinds.to_vec(),
                recursive,
            },
        );
        Ok(ViewRef { id })
    }

    async fn find_in_view(&self, view: &ViewRef, name_pattern: &str) -> Result<Vec<ObjectRef>> {
        let state = self.call();
        let view = state
            .views
            .get(&view.id)
            .ok_or_else(|| ReapError::NotFound(format!("view {}", view.id)))?;

        Ok(state
            .objects
            .values()
            .filter(|o| is_below(&o.path, &view.root, view.recursive))
            .filter(|o| view.kinds.is_empty() || view.kinds.contains(o.kind()))
            .filter(|o| segment_matches(name_pattern, last_segment(&o.path)))
            .map(|o| o.reference.clone())
            .collect())
    }

    async fn destroy_view(&self, view: &ViewRef) -> Result<()> {
        let mut state = self.call();
        state
            .views
            .remove(&view.id)
            .map(|_| ())
            .ok_or_else(|| ReapError::NotFound(format!("view {}", view.id)))
    }

    async fn retrieve(&self, refs: &[ObjectRef]) -> Result<Vec<InventoryObject>> {
        let state = self.call();
        if state.faults.retrieve {
            return Err(ReapError::Remote("property collector unavailable".to_string()));
        }
        let wanted: HashSet<&ObjectRef> = refs.iter().collect();
        Ok(state
            .objects
            .values()
            .filter(|o| wanted.contains(&o.reference))
            .cloned()
            .collect())
    }

    async fn power_off(&self, vm: &ObjectRef) -> Result<TaskRef> {
        let mut state = self.call();
        let path = state.require_path(vm)?;
        state.mutations.push(Mutation::PowerOff(path.clone()));

        if state.faults.power_off.contains(&path) {
            return Ok(state.task(Err(format!("cannot power off {}", path))));
        }
        let outcome = match state.objects.get_mut(&path).and_then(|o| o.vm.as_mut()) {
            Some(runtime) if runtime.power_state == PowerState::PoweredOn => {
                runtime.power_state = PowerState::PoweredOff;
                Ok(())
            }
            Some(_) => Err(format!("{} is not powered on", path)),
            None => Err(format!("{} is not a virtual machine", path)),
        };
        Ok(state.task(outcome))
    }

    async fn destroy(&self, object: &ObjectRef) -> Result<TaskRef> {
        let mut state = self.call();
        let path = state.require_path(object)?;
        if state.faults.reject_destroy.contains(&path) {
            return Err(ReapError::Remote(format!("destroy of {} rejected", path)));
        }
        state.mutations.push(Mutation::Destroy(path.clone()));

        if state.faults.destroy.contains(&path) {
            return Ok(state.task(Err(format!("cannot destroy {}", path))));
        }
        if state.has_children(&path) {
            return Ok(state.task(Err(format!("{} is in use", path))));
        }
        state.objects.remove(&path);
        Ok(state.task(Ok(())))
    }

    async fn wait_task(&self, task: &TaskRef) -> Result<()> {
        let outcome = {
            let mut state = self.call();
            state.awaited.push(task.id.clone());
            if state.faults.hang_tasks {
                None
            } else {
                Some(state.tasks.get(&task.id).cloned())
            }
        };

        match outcome {
            None => std::future::pending().await,
            Some(None) => Err(ReapError::NotFound(format!("task {}", task.id))),
            Some(Some(Ok(()))) => Ok(()),
            Some(Some(Err(message))) => Err(ReapError::Remote(message)),
        }
    }

    async fn find_custom_field(&self, name: &str) -> Result<Option<i32>> {
        Ok(self.call().fields.get(name).copied())
    }

    async fn add_custom_field(&self, name: &str) -> Result<i32> {
        let mut state = self.call();
        if state.fields.contains_key(name) {
            return Err(ReapError::Remote(format!("custom field {} already exists", name)));
        }
        state.mutations.push(Mutation::AddCustomField(name.to_string()));
        Ok(state.ensure_field(name))
    }

    async fn set_custom_field(&self, object: &ObjectRef, key: i32, value: &str) -> Result<()> {
        let mut state = self.call();
        let path = state.require_path(object)?;
        if !state.fields.values().any(|k| *k == key) {
            return Err(ReapError::NotFound(format!("custom field key {}", key)));
        }
        state
            .mutations
            .push(Mutation::SetCustomField(path.clone(), value.to_string()));
        if let Some(object) = state.objects.get_mut(&path) {
            set_value(object, key, value);
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeCatalog for MemoryPlatform {
    async fn query(&self, filter: &QueryFilter) -> Result<VolumePage> {
        let mut state = self.call();
        state.volume_queries += 1;

        let loose = state.loose_labels;
        let matching: Vec<&Volume> = state
            .volumes
            .iter()
            .filter(|v| {
                filter.labels.iter().all(|wanted| {
                    v.metadata.iter().flat_map(|m| &m.labels).any(|label| {
                        label.key == wanted.key
                            && (label.value == wanted.value
                                || (loose
                                    && (label.value.contains(&wanted.value)
                                        || wanted.value.contains(&label.value))))
                    })
                })
            })
            .collect();

        let limit = state.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        let start = filter
            .cursor
            .map(|c| c.offset as usize)
            .unwrap_or(0)
            .min(matching.len());
        let end = (start + limit).min(matching.len());
        let volumes: Vec<Volume> = matching[start..end].iter().map(|v| (*v).clone()).collect();

        Ok(VolumePage {
            cursor: Cursor {
                offset: end as u64,
                limit: limit as u64,
                total_records: matching.len() as u64,
            },
            volumes,
        })
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<TaskRef> {
        let mut state = self.call();
        state
            .mutations
            .push(Mutation::DeleteVolume(volume_id.to_string()));

        let before = state.volumes.len();
        state.volumes.retain(|v| v.id != volume_id);
        let outcome = if state.volumes.len() < before {
            Ok(())
        } else {
            Err(format!("volume {} not found", volume_id))
        };
        Ok(state.task(outcome))
    }
}

#[async_trait]
impl ClusterModules for MemoryPlatform {
    async fn list_modules(&self) -> Result<Vec<ClusterModule>> {
        Ok(self
            .call()
            .modules
            .values()
            .map(|e| e.module.clone())
            .collect())
    }

    async fn list_members(&self, module_id: &str) -> Result<Vec<ObjectRef>> {
        let state = self.call();
        if state.faults.members.contains(module_id) {
            return Err(ReapError::Remote(format!(
                "listing members of {} failed",
                module_id
            )));
        }
        state
            .modules
            .get(module_id)
            .map(|e| e.members.clone())
            .ok_or_else(|| ReapError::NotFound(format!("cluster module {}", module_id)))
    }

    async fn delete_module(&self, module_id: &str) -> Result<()> {
        let mut state = self.call();
        state
            .mutations
            .push(Mutation::DeleteModule(module_id.to_string()));
        state
            .modules
            .remove(module_id)
            .map(|_| ())
            .ok_or_else(|| ReapError::NotFound(format!("cluster module {}", module_id)))
    }
}

fn set_value(object: &mut InventoryObject, key: i32, value: &str) {
    match object.custom_values.iter_mut().find(|v| v.key == key) {
        Some(existing) => existing.value = value.to_string(),
        None => object.custom_values.push(CustomFieldValue {
            key,
            value: value.to_string(),
        }),
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit(PATH_SEPARATOR).next().unwrap_or(path)
}

/// Proper ancestors of `path`, outermost first.
fn ancestors(path: &str) -> Vec<&str> {
    path.match_indices(PATH_SEPARATOR)
        .map(|(i, _)| &path[..i])
        .filter(|p| !p.is_empty())
        .collect()
}

fn is_below(path: &str, root: &str, recursive: bool) -> bool {
    let Some(rest) = path
        .strip_prefix(root)
        .and_then(|r| r.strip_prefix(PATH_SEPARATOR))
    else {
        return false;
    };
    !rest.is_empty() && (recursive || !rest.contains(PATH_SEPARATOR))
}

fn segment_matches(pattern: &str, segment: &str) -> bool {
    pattern == "*" || pattern == segment
}

/// Match an inventory path where `*` stands for one whole element.
fn path_matches(pattern: &str, path: &str) -> bool {
    let mut pattern = pattern.split(PATH_SEPARATOR);
    let mut path = path.split(PATH_SEPARATOR);
    loop {
        match (pattern.next(), path.next()) {
            (None, None) => return true,
            (Some(p), Some(s)) if segment_matches(p, s) => continue,
            _ => return false,
        }
    }
}
