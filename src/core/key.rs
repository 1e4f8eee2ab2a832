use std::fmt;

use strum::{AsRefStr, Display};

use crate::core::{ValueType, encoding::escape_name};

/// What a [`Key`] addresses. Selects the path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, AsRefStr)]
pub enum StorageKind {
    #[strum(serialize = "attrs")]
    Attribute,
    #[strum(serialize = "assocs")]
    Association,
    #[strum(serialize = "indices")]
    Index,
}

/// # Key
///
/// Addresses a single attribute, association or index slot of a record, or of a whole type
/// namespace when `id` is `None`.
///
/// ## Layout
///
/// `[NAMESPACE] + ":" + [ID] + ":" + [SEGMENT] + (":" + [NAME])`:
///
/// - `[NAMESPACE]`: The record type, escaped with [`escape_name`].
/// - `[ID]`: The escaped record id; empty for namespace-level keys.
/// - `[SEGMENT]`: `attrs`, `assocs` or `indices`, see [`StorageKind`].
/// - `[NAME]`: Only present for collection-typed keys, which own a native structure each.
///   Scalar keys share the record's segment hash and are addressed by [`Key::name`] as the
///   hash field.
///
/// Since escaped components never contain `:`, distinct keys never share a path, unless
/// they are scalars of the same record and segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    namespace: String,
    id: Option<String>,
    name: String,
    value_type: ValueType,
    kind: StorageKind,
}

impl Key {
    pub fn new(
        namespace: impl Into<String>,
        id: Option<&str>,
        name: impl Into<String>,
        value_type: ValueType,
        kind: StorageKind,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.map(str::to_owned),
            name: name.into(),
            value_type,
            kind,
        }
    }

    pub fn attribute(namespace: &str, id: &str, name: &str, value_type: ValueType) -> Self {
        Self::new(namespace, Some(id), name, value_type, StorageKind::Attribute)
    }

    pub fn association(namespace: &str, id: &str, name: &str, value_type: ValueType) -> Self {
        Self::new(namespace, Some(id), name, value_type, StorageKind::Association)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn is_collection(&self) -> bool {
        self.value_type.is_collection()
    }

    /// The path prefix shared by every key of the record `id` within `namespace`.
    pub(crate) fn record_prefix(namespace: &str, id: &str) -> String {
        format!("{}:{}:", escape_name(namespace), escape_name(id))
    }

    /// The physical path of this key within the store.
    pub fn path(&self) -> String {
        let id = self.id.as_deref().map(escape_name).unwrap_or_default();
        let mut path = format!(
            "{}:{}:{}",
            escape_name(&self.namespace),
            id,
            self.kind.as_ref()
        );
        if self.is_collection() {
            path.push(':');
            path.push_str(&escape_name(&self.name));
        }
        path
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_collection() {
            write!(f, "{} ({})", self.path(), self.value_type)
        } else {
            write!(f, "{}#{} ({})", self.path(), self.name, self.value_type)
        }
    }
}
