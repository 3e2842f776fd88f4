//! Resource model of the lease broker.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a leased resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceState {
    Busy,
    Cleaning,
    Dirty,
    Free,
    Leased,
    ToBeDeleted,
    Tombstone,
    #[serde(other)]
    Other,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Busy => "busy",
            ResourceState::Cleaning => "cleaning",
            ResourceState::Dirty => "dirty",
            ResourceState::Free => "free",
            ResourceState::Leased => "leased",
            ResourceState::ToBeDeleted => "toBeDeleted",
            ResourceState::Tombstone => "tombstone",
            ResourceState::Other => "other",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// String key/value data attached to a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserData(BTreeMap<String, String>);

impl UserData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Merge `other` into this one. Empty values remove the key.
    pub fn update(&mut self, other: &UserData) {
        for (key, value) in &other.0 {
            if value.is_empty() {
                self.0.remove(key);
            } else {
                self.0.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for UserData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    pub state: ResourceState,
    #[serde(default)]
    pub owner: String,
    #[serde(rename = "lastupdate")]
    pub last_update: DateTime<Utc>,
    #[serde(rename = "userdata", default)]
    pub user_data: Option<UserData>,
    #[serde(
        rename = "expiration-date",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub expiration_date: Option<DateTime<Utc>>,
}

/// Resource counts of one type, by state and by owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub current: HashMap<String, i64>,
    #[serde(rename = "owner", default)]
    pub owners: HashMap<String, i64>,
}
