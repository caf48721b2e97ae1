use serde::{Deserialize, Serialize};

/// A resource kind: the `(group, resource)` pair that identifies one
/// collection of objects. Kinds are the unit of index ownership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Kind {
    pub group: String,
    pub resource: String,
}

impl Kind {
    pub fn new(group: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            resource: resource.to_string(),
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.resource)
    }
}

/// Fully qualified identity of a single stored object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(group: &str, resource: &str, namespace: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            resource: resource.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn kind(&self) -> Kind {
        Kind::new(&self.group, &self.resource)
    }

    /// Unique identifier within a kind, used as the document id.
    pub fn doc_id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// A versioned object as stored by the backend.
///
/// `manager` carries the identity of an external system managing this object
/// (e.g. a provisioning repository), if any. Managed-object queries group on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceObject {
    pub key: ResourceKey,
    pub resource_version: i64,
    pub value: serde_json::Value,
    pub manager: Option<String>,
}

/// Notification emitted by the backend change feed on every write.
///
/// Carries enough identity to decide whether an index needs an incremental
/// update. A `previous_version` of `None` means the object was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrittenEvent {
    pub key: ResourceKey,
    pub resource_version: i64,
    pub previous_version: Option<i64>,
}

/// Per-kind object count, as reported by a stats-capable backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStats {
    pub kind: Kind,
    pub count: usize,
}
