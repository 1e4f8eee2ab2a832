//! Relationship proxies over a [`Backend`].
//!
//! Associations are declared up front in a [`Registry`], keyed by the owning namespace and
//! the association name. Proxies built from the registry keep both sides of a declared
//! inverse consistent on every mutation: all of a mutation's changes run inside one lock
//! over both namespaces and one transaction.

use std::{collections::BTreeMap, fmt, sync::Arc};

use strum::Display;
use tracing::instrument;

use crate::{
    backend::Backend,
    core::{LinkError, LinkResult},
    lock::LockScope,
    record::RecordRef,
};

mod belongs_to;
mod has_many;

#[cfg(test)]
mod tests;

pub use belongs_to::BelongsTo;
pub use has_many::HasMany;

/// A lifecycle hook, called with the owning record and the affected related record.
pub type Callback = Arc<dyn Fn(&RecordRef, Option<&RecordRef>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Callbacks {
    pub before_add: Option<Callback>,
    pub after_add: Option<Callback>,
    pub before_remove: Option<Callback>,
    pub after_remove: Option<Callback>,
}

impl Callbacks {
    fn run(callback: &Option<Callback>, parent: &RecordRef, related: Option<&RecordRef>) {
        if let Some(callback) = callback {
            callback(parent, related);
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("before_add", &self.before_add.is_some())
            .field("after_add", &self.after_add.is_some())
            .field("before_remove", &self.before_remove.is_some())
            .field("after_remove", &self.after_remove.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum AssociationKind {
    BelongsTo,
    HasMany,
}

/// The declaration of one association.
#[derive(Debug, Clone)]
pub struct AssociationDef {
    kind: AssociationKind,
    related: String,
    inverse: Option<String>,
    callbacks: Callbacks,
}

impl AssociationDef {
    /// A single reference to a record of `related`.
    pub fn belongs_to(related: impl Into<String>) -> Self {
        Self::new(AssociationKind::BelongsTo, related.into())
    }

    /// A collection of references to records of `related`.
    pub fn has_many(related: impl Into<String>) -> Self {
        Self::new(AssociationKind::HasMany, related.into())
    }

    fn new(kind: AssociationKind, related: String) -> Self {
        Self {
            kind,
            related,
            inverse: None,
            callbacks: Callbacks::default(),
        }
    }

    /// Names the association on the related namespace that points back.
    pub fn inverse_of(mut self, name: impl Into<String>) -> Self {
        self.inverse = Some(name.into());
        self
    }

    pub fn before_add<F>(mut self, f: F) -> Self
    where
        F: Fn(&RecordRef, Option<&RecordRef>) + Send + Sync + 'static,
    {
        self.callbacks.before_add = Some(Arc::new(f));
        self
    }

    pub fn after_add<F>(mut self, f: F) -> Self
    where
        F: Fn(&RecordRef, Option<&RecordRef>) + Send + Sync + 'static,
    {
        self.callbacks.after_add = Some(Arc::new(f));
        self
    }

    pub fn before_remove<F>(mut self, f: F) -> Self
    where
        F: Fn(&RecordRef, Option<&RecordRef>) + Send + Sync + 'static,
    {
        self.callbacks.before_remove = Some(Arc::new(f));
        self
    }

    pub fn after_remove<F>(mut self, f: F) -> Self
    where
        F: Fn(&RecordRef, Option<&RecordRef>) + Send + Sync + 'static,
    {
        self.callbacks.after_remove = Some(Arc::new(f));
        self
    }

    pub fn kind(&self) -> AssociationKind {
        self.kind
    }

    pub fn related(&self) -> &str {
        &self.related
    }

    pub fn inverse(&self) -> Option<&str> {
        self.inverse.as_deref()
    }
}

/// A proxy of either kind, as needed by generic removal paths.
pub enum Association<'a> {
    BelongsTo(BelongsTo<'a>),
    HasMany(HasMany<'a>),
}

impl Association<'_> {
    /// Detaches the owner from everything this association links it to. Must run inside
    /// a scope covering both namespaces, usually within the owner's removal transaction.
    pub async fn on_remove(&self, scope: &LockScope) -> LinkResult<()> {
        match self {
            Association::BelongsTo(proxy) => proxy.on_remove(scope).await,
            Association::HasMany(proxy) => proxy.on_remove(scope).await,
        }
    }
}

/// All association declarations, keyed by `(namespace, name)`.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    defs: BTreeMap<(String, String), AssociationDef>,
}

impl Registry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Declares association `name` on records of `namespace`, replacing an earlier one.
    pub fn declare(
        &mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        def: AssociationDef,
    ) -> &mut Self {
        let (namespace, name) = (namespace.into(), name.into());
        trace!(%namespace, %name, kind = %def.kind, related = %def.related, "declared association");
        self.defs.insert((namespace, name), def);
        self
    }

    pub fn definition(&self, namespace: &str, name: &str) -> LinkResult<&AssociationDef> {
        self.defs
            .get(&(namespace.to_owned(), name.to_owned()))
            .ok_or_else(|| {
                LinkError::configuration(format!(
                    "no association '{}' declared on {}",
                    name, namespace
                ))
            })
    }

    /// All associations declared on `namespace`.
    pub fn associations_of<'r>(
        &'r self,
        namespace: &'r str,
    ) -> impl Iterator<Item = (&'r str, &'r AssociationDef)> + 'r {
        self.defs
            .iter()
            .filter(move |((ns, _), _)| ns == namespace)
            .map(|((_, name), def)| (name.as_str(), def))
    }

    fn expect_kind(
        &self,
        record: &RecordRef,
        name: &str,
        kind: AssociationKind,
    ) -> LinkResult<&AssociationDef> {
        let def = self.definition(record.namespace(), name)?;
        if def.kind != kind {
            return Err(LinkError::configuration(format!(
                "association '{}' on {} is {}, not {}",
                name,
                record.namespace(),
                def.kind,
                kind
            )));
        }
        Ok(def)
    }

    pub fn belongs_to<'a>(
        &'a self,
        backend: &'a Backend,
        record: &RecordRef,
        name: &str,
    ) -> LinkResult<BelongsTo<'a>> {
        let def = self.expect_kind(record, name, AssociationKind::BelongsTo)?;
        BelongsTo::new(backend, self, record.clone(), name, def)
    }

    pub fn has_many<'a>(
        &'a self,
        backend: &'a Backend,
        record: &RecordRef,
        name: &str,
    ) -> LinkResult<HasMany<'a>> {
        let def = self.expect_kind(record, name, AssociationKind::HasMany)?;
        HasMany::new(backend, self, record.clone(), name, def)
    }

    pub fn proxy<'a>(
        &'a self,
        backend: &'a Backend,
        record: &RecordRef,
        name: &str,
    ) -> LinkResult<Association<'a>> {
        match self.definition(record.namespace(), name)?.kind {
            AssociationKind::BelongsTo => self
                .belongs_to(backend, record, name)
                .map(Association::BelongsTo),
            AssociationKind::HasMany => self
                .has_many(backend, record, name)
                .map(Association::HasMany),
        }
    }

    /// Removes a record: detaches it through every association declared on its namespace,
    /// then purges its storage, all in one transaction under a lock over the record's
    /// namespace and every related one.
    #[instrument(skip_all, level = "debug", fields(record = %record))]
    pub async fn destroy(&self, backend: &Backend, record: &RecordRef) -> LinkResult<()> {
        let id = record.persisted_id()?;
        let names: Vec<&str> = self
            .associations_of(record.namespace())
            .map(|(name, _)| name)
            .collect();
        let proxies = names
            .iter()
            .map(|name| self.proxy(backend, record, name))
            .collect::<LinkResult<Vec<_>>>()?;

        let mut namespaces = vec![record.namespace().to_owned()];
        namespaces.extend(
            self.associations_of(record.namespace())
                .map(|(_, def)| def.related.clone()),
        );
        let scope = backend.lock(None, namespaces).await?;

        let result = async {
            let writes = backend.within(&scope);
            let new_txn = writes.begin_transaction().await;
            let result = async {
                for proxy in &proxies {
                    proxy.on_remove(&scope).await?;
                }
                writes.purge(record.namespace(), id).await
            }
            .await;
            writes.finish_transaction(new_txn, result).await
        }
        .await;
        scope.finish(result).await
    }
}
