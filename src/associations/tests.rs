use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    backend::BackendConfig,
    core::{StoreError, StoreResult},
    kv::{Command, Coordination, InMemoryStore, Store},
    tests::setup_tracing,
};

use super::*;

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .declare(
            "Team",
            "players",
            AssociationDef::has_many("Player").inverse_of("team"),
        )
        .declare(
            "Player",
            "team",
            AssociationDef::belongs_to("Team").inverse_of("players"),
        );
    registry
}

fn setup() -> (InMemoryStore, Backend, Registry) {
    setup_tracing();
    let store = InMemoryStore::new();
    let backend = Backend::new(store.clone(), BackendConfig::for_testing());
    (store, backend, registry())
}

fn team(id: &str) -> RecordRef {
    RecordRef::new("Team", id)
}

fn player(id: &str) -> RecordRef {
    RecordRef::new("Player", id)
}

async fn team_of(backend: &Backend, registry: &Registry, player: &RecordRef) -> Option<RecordRef> {
    registry
        .belongs_to(backend, player, "team")
        .unwrap()
        .value()
        .await
        .unwrap()
}

fn ids(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_team_player_lifecycle() {
    let (store, backend, registry) = setup();
    let (p, c1, c2) = (team("1"), player("1"), player("2"));
    let players = registry.has_many(&backend, &p, "players").unwrap();

    players.add(&[c1.clone(), c2.clone()]).await.unwrap();
    assert_eq!(team_of(&backend, &registry, &c1).await, Some(p.clone()));
    assert_eq!(team_of(&backend, &registry, &c2).await, Some(p.clone()));
    assert_eq!(players.ids().await.unwrap(), ids(&["1", "2"]));

    players.delete(&[c1.clone()]).await.unwrap();
    assert_eq!(team_of(&backend, &registry, &c1).await, None);
    assert_eq!(team_of(&backend, &registry, &c2).await, Some(p.clone()));
    assert_eq!(players.ids().await.unwrap(), ids(&["2"]));

    registry.destroy(&backend, &p).await.unwrap();
    assert_eq!(team_of(&backend, &registry, &c2).await, None);
    assert!(!store.exists("Team:1:assocs:players_ids").await.unwrap());
    assert!(store.keys("Team:1:").await.unwrap().is_empty());
    assert!(store.keys("lock:").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_query_delegation() {
    let (_store, backend, registry) = setup();
    let p = team("1");
    let players = registry.has_many(&backend, &p, "players").unwrap();
    assert!(players.is_empty().await.unwrap());

    players
        .append(&player("1"))
        .await
        .unwrap()
        .append(&player("2"))
        .await
        .unwrap()
        .append(&player("3"))
        .await
        .unwrap();

    assert_eq!(players.count().await.unwrap(), 3);
    assert!(players.exists("2").await.unwrap());
    assert_eq!(players.find_by_id("3").await.unwrap(), Some(player("3")));
    assert_eq!(players.find_by_id("4").await.unwrap(), None);
    assert_eq!(players.all().await.unwrap().len(), 3);
    assert_eq!(
        players.intersect(["2", "3", "9"]).ids().await.unwrap(),
        ids(&["2", "3"])
    );
    assert_eq!(players.diff(["1"]).count().await.unwrap(), 2);
    assert_eq!(
        players.select(|r| r.id() == Some("1")).await.unwrap(),
        vec![player("1")]
    );
    assert_eq!(players.reject(|r| r.id() == Some("1")).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_belongs_to_set_value() {
    let (_store, backend, registry) = setup();
    let c1 = player("1");
    let membership = registry.belongs_to(&backend, &c1, "team").unwrap();
    assert_eq!(membership.value().await.unwrap(), None);

    membership.set_value(Some(&team("1"))).await.unwrap();
    assert_eq!(membership.value().await.unwrap(), Some(team("1")));

    membership.set_value(None).await.unwrap();
    assert_eq!(membership.value().await.unwrap(), None);

    let err = membership.set_value(Some(&player("2"))).await.unwrap_err();
    assert!(matches!(err, LinkError::Validation(_)));
    let err = membership
        .set_value(Some(&RecordRef::unsaved("Team")))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Validation(_)));
}

#[tokio::test]
async fn test_callbacks_run_around_mutations() {
    setup_tracing();
    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = |label: &'static str| {
        let events = events.clone();
        move |parent: &RecordRef, related: Option<&RecordRef>| {
            let related = related.map(ToString::to_string).unwrap_or_default();
            events
                .lock()
                .unwrap()
                .push(format!("{label} {parent} {related}"));
        }
    };

    let mut registry = registry();
    registry.declare(
        "Player",
        "team",
        AssociationDef::belongs_to("Team")
            .inverse_of("players")
            .before_add(recorder("before_add"))
            .after_add(recorder("after_add"))
            .before_remove(recorder("before_remove"))
            .after_remove(recorder("after_remove")),
    );
    let backend = Backend::new(InMemoryStore::new(), BackendConfig::for_testing());

    let membership = registry.belongs_to(&backend, &player("1"), "team").unwrap();
    membership.set_value(Some(&team("1"))).await.unwrap();
    membership.set_value(None).await.unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "before_add Player:1 Team:1",
            "after_add Player:1 Team:1",
            "before_remove Player:1 Team:1",
            "after_remove Player:1 Team:1",
        ]
    );
}

#[tokio::test]
async fn test_invalid_batches_mutate_nothing() {
    let (store, backend, registry) = setup();
    let players = registry.has_many(&backend, &team("1"), "players").unwrap();

    let batches = [
        vec![],
        vec![player("1"), team("2")],
        vec![player("1"), RecordRef::unsaved("Player")],
    ];
    for batch in batches {
        let err = players.add(&batch).await.unwrap_err();
        assert!(matches!(err, LinkError::Validation(_)), "{err}");
        let err = players.delete(&batch).await.unwrap_err();
        assert!(matches!(err, LinkError::Validation(_)), "{err}");
    }
    assert_eq!(store.len().await, 0);
}

#[tokio::test]
async fn test_misdeclared_associations_fail_on_construction() {
    let (_store, backend, mut registry) = setup();
    registry
        .declare("Coach", "team", AssociationDef::belongs_to("Team"))
        .declare("Team", "coaches", AssociationDef::has_many("Coach").inverse_of("missing"));

    let missing_inverse = registry.belongs_to(&backend, &RecordRef::new("Coach", "1"), "team");
    assert!(matches!(missing_inverse, Err(LinkError::Configuration(_))));

    let dangling_inverse = registry.has_many(&backend, &team("1"), "coaches");
    assert!(matches!(dangling_inverse, Err(LinkError::Configuration(_))));

    let undeclared = registry.proxy(&backend, &team("1"), "sponsors");
    assert!(matches!(undeclared, Err(LinkError::Configuration(_))));

    let wrong_kind = registry.belongs_to(&backend, &team("1"), "players");
    assert!(matches!(wrong_kind, Err(LinkError::Configuration(_))));
}

#[tokio::test]
async fn test_deleting_a_non_member_is_a_noop() {
    let (_store, backend, registry) = setup();
    let c3 = player("3");
    registry
        .has_many(&backend, &team("2"), "players")
        .unwrap()
        .add(&[c3.clone()])
        .await
        .unwrap();

    let lions = registry.has_many(&backend, &team("1"), "players").unwrap();
    lions.delete(&[c3.clone()]).await.unwrap();

    assert_eq!(team_of(&backend, &registry, &c3).await, Some(team("2")));
    assert!(lions.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_adding_moves_record_between_owners() {
    let (_store, backend, registry) = setup();
    let c1 = player("1");
    let lions = registry.has_many(&backend, &team("1"), "players").unwrap();
    let tigers = registry.has_many(&backend, &team("2"), "players").unwrap();

    lions.add(&[c1.clone()]).await.unwrap();
    tigers.add(&[c1.clone()]).await.unwrap();

    assert_eq!(team_of(&backend, &registry, &c1).await, Some(team("2")));
    assert!(lions.is_empty().await.unwrap());
    assert_eq!(tigers.ids().await.unwrap(), ids(&["1"]));
}

#[tokio::test]
async fn test_failure_mid_batch_applies_nothing() {
    let (store, backend, registry) = setup();
    // the belongs_to hash of player 2 holds a set
    store
        .execute(vec![Command::SAdd {
            key: "Player:2:assocs:belongs_to".into(),
            members: vec!["garbage".into()],
        }])
        .await
        .unwrap();

    let players = registry.has_many(&backend, &team("1"), "players").unwrap();
    let err = players.add(&[player("1"), player("2")]).await.unwrap_err();
    assert!(matches!(
        err,
        LinkError::Store(StoreError::WrongType { .. })
    ));

    assert_eq!(team_of(&backend, &registry, &player("1")).await, None);
    assert!(players.is_empty().await.unwrap());
    assert!(!backend.in_transaction().await);
    assert!(store.keys("lock:").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_destroying_a_member_detaches_it() {
    let (store, backend, registry) = setup();
    let p = team("1");
    let players = registry.has_many(&backend, &p, "players").unwrap();
    players.add(&[player("1"), player("2")]).await.unwrap();

    registry.destroy(&backend, &player("1")).await.unwrap();

    assert_eq!(players.ids().await.unwrap(), ids(&["2"]));
    assert!(store.keys("Player:1:").await.unwrap().is_empty());
    assert_eq!(team_of(&backend, &registry, &player("2")).await, Some(p));

    let err = registry
        .destroy(&backend, &RecordRef::unsaved("Player"))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Validation(_)));
}

#[tokio::test]
async fn test_scope_outside_held_set_is_rejected() {
    let (_store, backend, registry) = setup();
    let scope = backend.lock(None, ["Coach"]).await.unwrap();
    let membership = registry.belongs_to(&backend, &player("1"), "team").unwrap();

    let err = membership.value_within(&scope).await.unwrap_err();
    assert!(matches!(err, LinkError::AlreadyLocking { .. }));
    scope.release().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_handles_serialize_mutations() {
    let (_store, backend, registry) = setup();
    let other = backend.handle();

    let lions = registry.has_many(&backend, &team("1"), "players").unwrap();
    let tigers = registry.has_many(&other, &team("2"), "players").unwrap();
    let lions_batch = [player("1"), player("2")];
    let tigers_batch = [player("3"), player("4")];

    let (first, second) = tokio::join!(lions.add(&lions_batch), tigers.add(&tigers_batch));
    first.unwrap();
    second.unwrap();

    assert_eq!(lions.ids().await.unwrap(), ids(&["1", "2"]));
    assert_eq!(tigers.ids().await.unwrap(), ids(&["3", "4"]));
    assert_eq!(team_of(&backend, &registry, &player("4")).await, Some(team("2")));
}

#[tokio::test]
async fn test_reassignment_runs_previous_owner_callbacks() {
    setup_tracing();
    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = |label: &'static str| {
        let events = events.clone();
        move |parent: &RecordRef, related: Option<&RecordRef>| {
            let related = related.map(ToString::to_string).unwrap_or_default();
            events
                .lock()
                .unwrap()
                .push(format!("{label} {parent} {related}"));
        }
    };

    let mut registry = registry();
    registry.declare(
        "Team",
        "players",
        AssociationDef::has_many("Player")
            .inverse_of("team")
            .before_add(recorder("before_add"))
            .after_add(recorder("after_add"))
            .before_remove(recorder("before_remove"))
            .after_remove(recorder("after_remove")),
    );
    let backend = Backend::new(InMemoryStore::new(), BackendConfig::for_testing());
    let c1 = player("1");

    registry
        .has_many(&backend, &team("1"), "players")
        .unwrap()
        .add(&[c1.clone()])
        .await
        .unwrap();
    events.lock().unwrap().clear();

    let tigers = registry.has_many(&backend, &team("2"), "players").unwrap();
    tigers.add(&[c1.clone()]).await.unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "before_add Team:2 Player:1",
            "before_remove Team:1 Player:1",
            "after_remove Team:1 Player:1",
            "after_add Team:2 Player:1",
        ]
    );
    assert_eq!(team_of(&backend, &registry, &c1).await, Some(team("2")));
}

/// Suspends before every call, so concurrent operations interleave at each store access.
struct YieldingStore(InMemoryStore);

#[async_trait]
impl Store for YieldingStore {
    fn coordination(&self) -> Coordination {
        self.0.coordination()
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        tokio::task::yield_now().await;
        self.0.exists(key).await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        tokio::task::yield_now().await;
        self.0.hget(key, field).await
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
        tokio::task::yield_now().await;
        self.0.hmget(key, fields).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<BTreeMap<String, String>> {
        tokio::task::yield_now().await;
        self.0.hgetall(key).await
    }

    async fn smembers(&self, key: &str) -> StoreResult<BTreeSet<String>> {
        tokio::task::yield_now().await;
        self.0.smembers(key).await
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        tokio::task::yield_now().await;
        self.0.sismember(key, member).await
    }

    async fn zrange(&self, key: &str) -> StoreResult<Vec<String>> {
        tokio::task::yield_now().await;
        self.0.zrange(key).await
    }

    async fn lrange(&self, key: &str) -> StoreResult<Vec<String>> {
        tokio::task::yield_now().await;
        self.0.lrange(key).await
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        tokio::task::yield_now().await;
        self.0.keys(prefix).await
    }

    async fn execute(&self, batch: Vec<Command>) -> StoreResult<()> {
        tokio::task::yield_now().await;
        self.0.execute(batch).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        tokio::task::yield_now().await;
        self.0.set_if_absent(key, value, ttl).await
    }

    async fn extend_if_equals(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        tokio::task::yield_now().await;
        self.0.extend_if_equals(key, value, ttl).await
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> StoreResult<bool> {
        tokio::task::yield_now().await;
        self.0.delete_if_equals(key, value).await
    }
}

#[tokio::test]
async fn test_interleaved_mutations_on_one_handle_stay_apart() {
    setup_tracing();
    let store = InMemoryStore::new();
    let backend = Backend::new(YieldingStore(store.clone()), BackendConfig::for_testing());
    let mut registry = registry();
    registry
        .declare(
            "Club",
            "members",
            AssociationDef::has_many("Member").inverse_of("club"),
        )
        .declare(
            "Member",
            "club",
            AssociationDef::belongs_to("Club").inverse_of("members"),
        );
    // the belongs_to hash of player 2 holds a set
    store
        .execute(vec![Command::SAdd {
            key: "Player:2:assocs:belongs_to".into(),
            members: vec!["garbage".into()],
        }])
        .await
        .unwrap();

    let lions = registry.has_many(&backend, &team("1"), "players").unwrap();
    let club = registry
        .has_many(&backend, &RecordRef::new("Club", "1"), "members")
        .unwrap();
    let lions_batch = [player("1"), player("2")];
    let club_batch = [RecordRef::new("Member", "1")];

    let (failed, added) = tokio::join!(lions.add(&lions_batch), club.add(&club_batch));
    assert!(matches!(
        failed,
        Err(LinkError::Store(StoreError::WrongType { .. }))
    ));
    added.unwrap();

    assert!(lions.is_empty().await.unwrap());
    assert_eq!(team_of(&backend, &registry, &player("1")).await, None);
    assert_eq!(club.ids().await.unwrap(), ids(&["1"]));
    let membership = registry
        .belongs_to(&backend, &RecordRef::new("Member", "1"), "club")
        .unwrap();
    assert_eq!(membership.value().await.unwrap(), Some(RecordRef::new("Club", "1")));
    assert!(!backend.in_transaction().await);
    assert!(store.keys("lock:").await.unwrap().is_empty());
}
