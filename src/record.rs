use crate::core::{LinkError, LinkResult};

/// A handle to a record: its type namespace and, once persisted, its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("{}:{}", namespace, id.as_deref().unwrap_or("<unsaved>"))]
pub struct RecordRef {
    namespace: String,
    id: Option<String>,
}

impl RecordRef {
    /// A persisted record.
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: Some(id.into()),
        }
    }

    /// A record that has not been saved yet.
    pub fn unsaved(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: None,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Returns `true` for a record with a non-empty id.
    pub fn is_persisted(&self) -> bool {
        self.id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// The id of a persisted record, or a validation error.
    ///
    /// An empty id is rejected: its keys would share the namespace-level path.
    pub(crate) fn persisted_id(&self) -> LinkResult<&str> {
        match self.id.as_deref() {
            Some("") => Err(LinkError::validation(format!(
                "record of {} has an empty id",
                self.namespace
            ))),
            Some(id) => Ok(id),
            None => Err(LinkError::validation(format!("record {} is not persisted", self))),
        }
    }

    /// Checks that this record is a persisted record of `namespace`.
    pub(crate) fn expect_persisted_in(&self, namespace: &str) -> LinkResult<&str> {
        if self.namespace != namespace {
            return Err(LinkError::validation(format!(
                "expected a {} record, got {}",
                namespace, self
            )));
        }
        self.persisted_id()
    }
}
