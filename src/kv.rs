use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::Bound,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::RwLock, time::Instant};

use crate::core::{StoreError, StoreResult};

/// Whether a store can coordinate exclusive access between independent handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coordination {
    /// Only a single writer ever talks to the store; locking is a no-op.
    SingleWriter,
    /// The store supports expiring leases through [`Store::set_if_absent`] and
    /// [`Store::delete_if_equals`].
    Leases,
}

/// A native write command. A batch of these is applied atomically by [`Store::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
    SAdd {
        key: String,
        members: Vec<String>,
    },
    SRem {
        key: String,
        members: Vec<String>,
    },
    SMove {
        from: String,
        to: String,
        member: String,
    },
    ZAdd {
        key: String,
        entries: Vec<(f64, String)>,
    },
    ZRem {
        key: String,
        members: Vec<String>,
    },
    RPush {
        key: String,
        values: Vec<String>,
    },
    /// Removes every occurrence of `value`.
    LRem {
        key: String,
        value: String,
    },
    Del {
        keys: Vec<String>,
    },
}

impl Command {
    /// Every key this command may modify.
    fn keys(&self) -> Vec<&str> {
        match self {
            Command::HSet { key, .. }
            | Command::HDel { key, .. }
            | Command::SAdd { key, .. }
            | Command::SRem { key, .. }
            | Command::ZAdd { key, .. }
            | Command::ZRem { key, .. }
            | Command::RPush { key, .. }
            | Command::LRem { key, .. } => vec![key.as_str()],
            Command::SMove { from, to, .. } => vec![from.as_str(), to.as_str()],
            Command::Del { keys } => keys.iter().map(String::as_str).collect(),
        }
    }
}

/// The store protocol: a key-value store with native hash, set, sorted-set and list values.
///
/// Collections that become empty cease to exist, and a key holding one type of value
/// rejects commands for another type with [`StoreError::WrongType`].
#[async_trait]
pub trait Store: Send + Sync {
    /// The locking capability of this store.
    fn coordination(&self) -> Coordination;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Reads several fields of a hash, `None` for each missing one.
    async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>>;

    async fn hgetall(&self, key: &str) -> StoreResult<BTreeMap<String, String>>;

    async fn smembers(&self, key: &str) -> StoreResult<BTreeSet<String>>;

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// All members of a sorted set, ascending by score.
    async fn zrange(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn lrange(&self, key: &str) -> StoreResult<Vec<String>>;

    /// All existing keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Applies every command of the batch, or none of them.
    async fn execute(&self, batch: Vec<Command>) -> StoreResult<()>;

    /// Stores `value` under `key` for `ttl`, unless the key already exists.
    /// Returns `true` when the value was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Resets the ttl of `key` only while it still holds `value`. Returns `true` when
    /// extended.
    async fn extend_if_equals(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Deletes `key` only while it still holds `value`. Returns `true` when deleted.
    async fn delete_if_equals(&self, key: &str, value: &str) -> StoreResult<bool>;
}

#[derive(Debug, Clone)]
enum Entry {
    Lease { value: String, expires_at: Instant },
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    /// member -> score
    SortedSet(BTreeMap<String, f64>),
    List(Vec<String>),
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        match self {
            Entry::Lease { expires_at, .. } => *expires_at > now,
            _ => true,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Entry::Lease { .. } => false,
            Entry::Hash(h) => h.is_empty(),
            Entry::Set(s) => s.is_empty(),
            Entry::SortedSet(z) => z.is_empty(),
            Entry::List(l) => l.is_empty(),
        }
    }
}

type Keyspace = BTreeMap<String, Entry>;

fn wrong_type(key: &str, expected: &'static str) -> StoreError {
    StoreError::WrongType {
        key: key.to_owned(),
        expected,
    }
}

/// Borrows the value of a live key as the given variant, `None` if the key is missing.
macro_rules! typed_ref {
    ($map:expr, $key:expr, $variant:ident, $name:literal) => {
        match $map.get($key) {
            None => Ok(None),
            Some(Entry::$variant(inner)) => Ok(Some(inner)),
            Some(entry) if !entry.is_live(Instant::now()) => Ok(None),
            Some(_) => Err(wrong_type($key, $name)),
        }
    };
}

/// Mutably borrows the value of a key as the given variant, creating it if missing.
macro_rules! typed_mut {
    ($map:expr, $key:expr, $variant:ident, $name:literal) => {{
        if matches!($map.get($key.as_str()), Some(entry) if !entry.is_live(Instant::now())) {
            $map.remove($key.as_str());
        }
        match $map
            .entry($key.clone())
            .or_insert_with(|| Entry::$variant(Default::default()))
        {
            Entry::$variant(inner) => Ok(inner),
            _ => Err(wrong_type(&$key, $name)),
        }
    }};
}

/// Mutably borrows the value of an existing key as the given variant.
macro_rules! typed_existing_mut {
    ($map:expr, $key:expr, $variant:ident, $name:literal) => {
        match $map.get_mut($key.as_str()) {
            None => Ok(None),
            Some(Entry::$variant(inner)) => Ok(Some(inner)),
            Some(entry) if !entry.is_live(Instant::now()) => Ok(None),
            Some(_) => Err(wrong_type(&$key, $name)),
        }
    };
}

fn apply_command(map: &mut Keyspace, command: Command) -> StoreResult<()> {
    let touched: Vec<String> = command.keys().into_iter().map(str::to_owned).collect();
    match command {
        Command::HSet { key, fields } => {
            typed_mut!(map, key, Hash, "hash")?.extend(fields);
        }
        Command::HDel { key, fields } => {
            if let Some(hash) = typed_existing_mut!(map, key, Hash, "hash")? {
                for field in &fields {
                    hash.remove(field);
                }
            }
        }
        Command::SAdd { key, members } => {
            typed_mut!(map, key, Set, "set")?.extend(members);
        }
        Command::SRem { key, members } => {
            if let Some(set) = typed_existing_mut!(map, key, Set, "set")? {
                for member in &members {
                    set.remove(member);
                }
            }
        }
        Command::SMove { from, to, member } => {
            // the destination must hold a set even when nothing moves
            typed_ref!(map, to.as_str(), Set, "set")?;
            let moved = match typed_existing_mut!(map, from, Set, "set")? {
                Some(set) => set.remove(&member),
                None => false,
            };
            if moved {
                typed_mut!(map, to, Set, "set")?.insert(member);
            }
        }
        Command::ZAdd { key, entries } => {
            let zset = typed_mut!(map, key, SortedSet, "sorted set")?;
            for (score, member) in entries {
                zset.insert(member, score);
            }
        }
        Command::ZRem { key, members } => {
            if let Some(zset) = typed_existing_mut!(map, key, SortedSet, "sorted set")? {
                for member in &members {
                    zset.remove(member);
                }
            }
        }
        Command::RPush { key, values } => {
            typed_mut!(map, key, List, "list")?.extend(values);
        }
        Command::LRem { key, value } => {
            if let Some(list) = typed_existing_mut!(map, key, List, "list")? {
                list.retain(|v| *v != value);
            }
        }
        Command::Del { keys } => {
            for key in &keys {
                map.remove(key);
            }
        }
    }

    // empty collections cease to exist
    for key in touched {
        if map.get(&key).is_some_and(Entry::is_empty) {
            map.remove(&key);
        }
    }
    Ok(())
}

/// An in-process [`Store`] with the semantics of a Redis server.
///
/// Clones share the same keyspace, which makes a clone behave like another connection to
/// the same server.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Keyspace>>,
    coordination: Coordination,
}

impl InMemoryStore {
    /// A store that supports leases, and thereby distributed locking.
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            coordination: Coordination::Leases,
        }
    }

    /// A store that advertises a single writer, so backends over it skip locking.
    pub fn single_writer() -> Self {
        Self {
            inner: Arc::default(),
            coordination: Coordination::SingleWriter,
        }
    }

    /// Number of live keys. Mostly useful for tests.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    fn coordination(&self) -> Coordination {
        self.coordination
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let inner = self.inner.read().await;
        Ok(inner.get(key).is_some_and(|e| e.is_live(Instant::now())))
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.read().await;
        Ok(typed_ref!(inner, key, Hash, "hash")?.and_then(|h| h.get(field).cloned()))
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
        let inner = self.inner.read().await;
        let hash = typed_ref!(inner, key, Hash, "hash")?;
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|h| h.get(field).cloned()))
            .collect())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<BTreeMap<String, String>> {
        let inner = self.inner.read().await;
        Ok(typed_ref!(inner, key, Hash, "hash")?
            .cloned()
            .unwrap_or_default())
    }

    async fn smembers(&self, key: &str) -> StoreResult<BTreeSet<String>> {
        let inner = self.inner.read().await;
        Ok(typed_ref!(inner, key, Set, "set")?
            .cloned()
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let inner = self.inner.read().await;
        Ok(typed_ref!(inner, key, Set, "set")?.is_some_and(|s| s.contains(member)))
    }

    async fn zrange(&self, key: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.read().await;
        let Some(zset) = typed_ref!(inner, key, SortedSet, "sorted set")? else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(&String, &f64)> = zset.iter().collect();
        entries.sort_by(|(m1, s1), (m2, s2)| s1.total_cmp(s2).then_with(|| m1.cmp(m2)));
        Ok(entries.into_iter().map(|(m, _)| m.clone()).collect())
    }

    async fn lrange(&self, key: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(typed_ref!(inner, key, List, "list")?
            .cloned()
            .unwrap_or_default())
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.read().await;
        let now = Instant::now();
        Ok(inner
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn execute(&self, batch: Vec<Command>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        // prior state of every touched key, restored if any command fails
        let mut undo: HashMap<String, Option<Entry>> = HashMap::new();

        for command in batch {
            for key in command.keys() {
                if !undo.contains_key(key) {
                    undo.insert(key.to_owned(), inner.get(key).cloned());
                }
            }
            if let Err(err) = apply_command(&mut inner, command) {
                for (key, prior) in undo {
                    match prior {
                        Some(entry) => {
                            inner.insert(key, entry);
                        }
                        None => {
                            inner.remove(&key);
                        }
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        if inner.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        inner.insert(
            key.to_owned(),
            Entry::Lease {
                value: value.to_owned(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn extend_if_equals(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        match inner.get_mut(key) {
            Some(Entry::Lease {
                value: held,
                expires_at,
            }) if held.as_str() == value && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let holds_value = match inner.get(key) {
            Some(entry @ Entry::Lease { value: held, .. }) => {
                held == value && entry.is_live(Instant::now())
            }
            _ => false,
        };
        if holds_value {
            inner.remove(key);
        }
        Ok(holds_value)
    }
}
