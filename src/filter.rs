use std::collections::BTreeSet;

use futures::{
    FutureExt, StreamExt,
    future::BoxFuture,
    stream::{self, BoxStream},
};

use crate::{
    backend::Backend,
    core::{Key, LinkError, LinkResult, Value, ValueType},
    record::RecordRef,
};

/// The right-hand side of a set algebra step.
#[derive(Debug, Clone)]
pub enum Operand {
    Ids(BTreeSet<String>),
    /// The ids another filter resolves to at evaluation time.
    Filter(Plan),
}

impl From<BTreeSet<String>> for Operand {
    fn from(ids: BTreeSet<String>) -> Self {
        Operand::Ids(ids)
    }
}

impl From<Vec<String>> for Operand {
    fn from(ids: Vec<String>) -> Self {
        Operand::Ids(ids.into_iter().collect())
    }
}

impl<const N: usize> From<[&str; N]> for Operand {
    fn from(ids: [&str; N]) -> Self {
        Operand::Ids(ids.into_iter().map(str::to_owned).collect())
    }
}

impl From<&Filter<'_>> for Operand {
    fn from(filter: &Filter<'_>) -> Self {
        Operand::Filter(filter.plan.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetOp {
    Intersect,
    Union,
    Diff,
}

/// The recorded steps of a filter, evaluated against the store at every terminal call.
#[derive(Debug, Clone)]
pub struct Plan {
    ids_key: Key,
    related: String,
    steps: Vec<(SetOp, Operand)>,
}

impl Plan {
    fn resolve<'a>(&'a self, backend: &'a Backend) -> BoxFuture<'a, LinkResult<BTreeSet<String>>> {
        async move {
            let mut ids = match backend.get(&self.ids_key).await? {
                Some(Value::Set(ids)) => ids,
                Some(Value::List(ids)) => ids.into_iter().collect(),
                _ => BTreeSet::new(),
            };

            for (op, operand) in &self.steps {
                let other = match operand {
                    Operand::Ids(other) => other.clone(),
                    Operand::Filter(plan) => {
                        if plan.related != self.related {
                            return Err(LinkError::validation(format!(
                                "cannot combine a filter over {} with one over {}",
                                self.related, plan.related
                            )));
                        }
                        plan.resolve(backend).await?
                    }
                };
                ids = match op {
                    SetOp::Intersect => ids.intersection(&other).cloned().collect(),
                    SetOp::Union => ids.union(&other).cloned().collect(),
                    SetOp::Diff => ids.difference(&other).cloned().collect(),
                };
            }
            Ok(ids)
        }
        .boxed()
    }
}

/// # Filter
///
/// A lazy query over the ids held by a collection key, naming records of one related
/// namespace.
///
/// Set algebra steps are only recorded. Every terminal call (`ids`, `count`, `all`, ...)
/// evaluates them against the current store state, so a filter never goes stale.
pub struct Filter<'a> {
    backend: &'a Backend,
    plan: Plan,
}

impl<'a> Filter<'a> {
    pub(crate) fn new(backend: &'a Backend, ids_key: Key, related: &str) -> Self {
        Self {
            backend,
            plan: Plan {
                ids_key,
                related: related.to_owned(),
                steps: Vec::new(),
            },
        }
    }

    pub fn related(&self) -> &str {
        &self.plan.related
    }

    // -- Set Algebra --

    /// Keeps only ids also present in `other`.
    pub fn intersect(mut self, other: impl Into<Operand>) -> Self {
        self.plan.steps.push((SetOp::Intersect, other.into()));
        self
    }

    /// Adds the ids of `other`.
    pub fn union(mut self, other: impl Into<Operand>) -> Self {
        self.plan.steps.push((SetOp::Union, other.into()));
        self
    }

    /// Removes the ids of `other`.
    pub fn diff(mut self, other: impl Into<Operand>) -> Self {
        self.plan.steps.push((SetOp::Diff, other.into()));
        self
    }

    // -- Terminals --

    pub async fn ids(&self) -> LinkResult<BTreeSet<String>> {
        self.plan.resolve(self.backend).await
    }

    pub async fn count(&self) -> LinkResult<usize> {
        Ok(self.ids().await?.len())
    }

    pub async fn is_empty(&self) -> LinkResult<bool> {
        Ok(self.ids().await?.is_empty())
    }

    pub async fn exists(&self, id: &str) -> LinkResult<bool> {
        if self.plan.steps.is_empty() && self.plan.ids_key.value_type() == ValueType::Set {
            return self.backend.includes(&self.plan.ids_key, id).await;
        }
        Ok(self.ids().await?.contains(id))
    }

    pub async fn find_by_id(&self, id: &str) -> LinkResult<Option<RecordRef>> {
        Ok(self
            .exists(id)
            .await?
            .then(|| RecordRef::new(self.related(), id)))
    }

    pub async fn all(&self) -> LinkResult<Vec<RecordRef>> {
        Ok(self
            .ids()
            .await?
            .into_iter()
            .map(|id| RecordRef::new(self.related(), id))
            .collect())
    }

    /// Streams the matching records. The ids are resolved once, on first poll.
    pub fn into_stream(self) -> BoxStream<'a, LinkResult<RecordRef>> {
        stream::once(async move {
            match self.all().await {
                Ok(records) => records.into_iter().map(Ok).collect(),
                Err(err) => vec![Err(err)],
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }

    pub async fn select<F>(&self, mut predicate: F) -> LinkResult<Vec<RecordRef>>
    where
        F: FnMut(&RecordRef) -> bool,
    {
        let mut records = self.all().await?;
        records.retain(|record| predicate(record));
        Ok(records)
    }

    pub async fn reject<F>(&self, mut predicate: F) -> LinkResult<Vec<RecordRef>>
    where
        F: FnMut(&RecordRef) -> bool,
    {
        self.select(|record| !predicate(record)).await
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::{backend::BackendConfig, kv::InMemoryStore, tests::setup_tracing};

    fn ids(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn seeded() -> (Backend, Key, Key) {
        let backend = Backend::new(InMemoryStore::new(), BackendConfig::for_testing());
        let lions = Key::association("Team", "1", "players_ids", ValueType::Set);
        let tigers = Key::association("Team", "2", "players_ids", ValueType::Set);
        backend.add(&lions, Value::Set(ids(&["1", "2", "3"]))).await.unwrap();
        backend.add(&tigers, Value::Set(ids(&["3", "4"]))).await.unwrap();
        (backend, lions, tigers)
    }

    #[tokio::test]
    async fn test_terminals() {
        setup_tracing();
        let (backend, lions, _) = seeded().await;
        let filter = backend.filter(lions.clone(), "Player");

        assert_eq!(filter.ids().await.unwrap(), ids(&["1", "2", "3"]));
        assert_eq!(filter.count().await.unwrap(), 3);
        assert!(!filter.is_empty().await.unwrap());
        assert!(filter.exists("2").await.unwrap());
        assert!(!filter.exists("4").await.unwrap());
        assert_eq!(
            filter.find_by_id("1").await.unwrap(),
            Some(RecordRef::new("Player", "1"))
        );
        assert_eq!(filter.find_by_id("9").await.unwrap(), None);

        let streamed: Vec<RecordRef> = backend
            .filter(lions, "Player")
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(streamed, filter.all().await.unwrap());

        let odd = filter
            .select(|r| r.id().is_some_and(|id| id != "2"))
            .await
            .unwrap();
        assert_eq!(odd, vec![RecordRef::new("Player", "1"), RecordRef::new("Player", "3")]);
        let even = filter
            .reject(|r| r.id().is_some_and(|id| id != "2"))
            .await
            .unwrap();
        assert_eq!(even, vec![RecordRef::new("Player", "2")]);
    }

    #[tokio::test]
    async fn test_set_algebra() {
        setup_tracing();
        let (backend, lions, tigers) = seeded().await;
        let tigers = backend.filter(tigers, "Player");

        let both = backend.filter(lions.clone(), "Player").intersect(&tigers);
        assert_eq!(both.ids().await.unwrap(), ids(&["3"]));
        assert!(both.exists("3").await.unwrap());

        let either = backend.filter(lions.clone(), "Player").union(&tigers);
        assert_eq!(either.ids().await.unwrap(), ids(&["1", "2", "3", "4"]));

        let only_lions = backend
            .filter(lions.clone(), "Player")
            .diff(&tigers)
            .diff(["1"]);
        assert_eq!(only_lions.ids().await.unwrap(), ids(&["2"]));
    }

    #[tokio::test]
    async fn test_filter_reads_live_state() {
        setup_tracing();
        let (backend, lions, _) = seeded().await;
        let filter = backend.filter(lions.clone(), "Player").intersect(["1", "5"]);
        assert_eq!(filter.ids().await.unwrap(), ids(&["1"]));

        backend.add(&lions, "5").await.unwrap();
        assert_eq!(filter.ids().await.unwrap(), ids(&["1", "5"]));
    }

    #[tokio::test]
    async fn test_combining_different_namespaces_fails() {
        setup_tracing();
        let (backend, lions, tigers) = seeded().await;
        let coaches = backend.filter(tigers, "Coach");
        let err = backend
            .filter(lions, "Player")
            .union(&coaches)
            .ids()
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Validation(_)));
    }
}
