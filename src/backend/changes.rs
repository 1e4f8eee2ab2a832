use std::collections::{BTreeMap, BTreeSet};

use strum::{Display, EnumDiscriminants};
use tokio::sync::Mutex;

use crate::{
    core::{Key, LinkError, LinkResult, Value, ValueType},
    kv::{Command, Store},
};

/// A single pending mutation. Shapes are validated on construction, so every queued
/// change can be planned into native commands.
#[derive(Debug, Clone, PartialEq, EnumDiscriminants)]
#[strum_discriminants(
    name(ChangeOp),
    derive(Display),
    strum(serialize_all = "snake_case")
)]
pub(crate) enum Change {
    /// Inserts members, or merges fields for hashes.
    Add { key: Key, value: Value },
    /// Removes members, or fields for hashes.
    Delete { key: Key, value: Value },
    /// Relocates members (sets) or fields (hashes) to another key of the same type.
    Move { key: Key, value: Value, to: Key },
    /// Removes the whole key, or the field of a scalar key.
    Clear { key: Key },
    /// Replaces the whole value; `None` clears.
    Set { key: Key, value: Option<Value> },
    /// Removes all storage of a record.
    Purge { namespace: String, id: String },
}

fn require_collection(key: &Key, op: ChangeOp) -> LinkResult<()> {
    if key.is_collection() {
        Ok(())
    } else {
        Err(LinkError::unsupported(format!(
            "'{}' is not supported on {} key {}",
            op,
            key.value_type(),
            key
        )))
    }
}

fn require_type(key: &Key, value: &Value, accepted: &[ValueType]) -> LinkResult<()> {
    if accepted.contains(&value.value_type()) {
        Ok(())
    } else {
        Err(LinkError::shape_mismatch(key.value_type(), value.value_type()))
    }
}

/// Record keys need a non-empty id; an empty one would share the namespace-level path.
fn require_addressable(key: &Key) -> LinkResult<()> {
    match key.id() {
        Some("") => Err(LinkError::validation(format!("key {} has an empty record id", key))),
        _ => Ok(()),
    }
}

const MEMBER_TYPES: &[ValueType] = &[ValueType::String, ValueType::List, ValueType::Set];

impl Change {
    pub(crate) fn add(key: Key, value: Value) -> LinkResult<Self> {
        require_addressable(&key)?;
        require_collection(&key, ChangeOp::Add)?;
        match key.value_type() {
            ValueType::Set | ValueType::List => require_type(&key, &value, MEMBER_TYPES)?,
            ValueType::SortedSet => require_type(&key, &value, &[ValueType::SortedSet])?,
            _ => require_type(&key, &value, &[ValueType::Hash])?,
        }
        Ok(Change::Add { key, value })
    }

    pub(crate) fn delete(key: Key, value: Value) -> LinkResult<Self> {
        require_addressable(&key)?;
        require_collection(&key, ChangeOp::Delete)?;
        match key.value_type() {
            ValueType::SortedSet => require_type(
                &key,
                &value,
                &[ValueType::String, ValueType::List, ValueType::Set, ValueType::SortedSet],
            )?,
            ValueType::Hash => require_type(
                &key,
                &value,
                &[ValueType::String, ValueType::List, ValueType::Set, ValueType::Hash],
            )?,
            _ => require_type(&key, &value, MEMBER_TYPES)?,
        }
        Ok(Change::Delete { key, value })
    }

    pub(crate) fn move_to(key: Key, value: Value, to: Key) -> LinkResult<Self> {
        require_addressable(&key)?;
        require_addressable(&to)?;
        require_collection(&key, ChangeOp::Move)?;
        match key.value_type() {
            ValueType::Set => require_type(&key, &value, MEMBER_TYPES)?,
            ValueType::Hash => require_type(&key, &value, &[ValueType::Hash])?,
            other => {
                return Err(LinkError::unsupported(format!(
                    "'move' is not supported on {} keys",
                    other
                )));
            }
        }
        if to.value_type() != key.value_type() {
            return Err(LinkError::validation(format!(
                "cannot move from {} key {} to {} key {}",
                key.value_type(),
                key,
                to.value_type(),
                to
            )));
        }
        Ok(Change::Move { key, value, to })
    }

    pub(crate) fn clear(key: Key) -> LinkResult<Self> {
        require_addressable(&key)?;
        Ok(Change::Clear { key })
    }

    pub(crate) fn set(key: Key, value: Option<Value>) -> LinkResult<Self> {
        require_addressable(&key)?;
        if let Some(value) = &value
            && value.value_type() != key.value_type()
        {
            return Err(LinkError::shape_mismatch(key.value_type(), value.value_type()));
        }
        Ok(Change::Set { key, value })
    }

    pub(crate) fn purge(namespace: &str, id: &str) -> LinkResult<Self> {
        if id.is_empty() {
            return Err(LinkError::validation(format!(
                "cannot purge a {} record with an empty id",
                namespace
            )));
        }
        Ok(Change::Purge {
            namespace: namespace.to_owned(),
            id: id.to_owned(),
        })
    }

    pub(crate) fn op(&self) -> ChangeOp {
        self.into()
    }

    /// The target of this change; records for purges.
    pub(crate) fn target(&self) -> String {
        match self {
            Change::Add { key, .. }
            | Change::Delete { key, .. }
            | Change::Move { key, .. }
            | Change::Clear { key }
            | Change::Set { key, .. } => key.to_string(),
            Change::Purge { namespace, id } => format!("{namespace}:{id}"),
        }
    }
}

/// The pending changes of one transaction owner, `None` while no transaction is open.
#[derive(Debug, Default)]
pub(crate) struct ChangeSet(Mutex<Option<Vec<Change>>>);

impl ChangeSet {
    /// Opens a transaction. Returns `false` if one is already open.
    pub(crate) async fn begin(&self) -> bool {
        let mut pending = self.0.lock().await;
        if pending.is_some() {
            return false;
        }
        *pending = Some(Vec::new());
        true
    }

    /// Buffers `changes` if a transaction is open, otherwise hands them back.
    pub(crate) async fn queue(&self, changes: Vec<Change>) -> Option<Vec<Change>> {
        let mut pending = self.0.lock().await;
        match pending.as_mut() {
            Some(buffered) => {
                for change in &changes {
                    trace!(op = %change.op(), target = %change.target(), "queued change");
                }
                buffered.extend(changes);
                None
            }
            None => Some(changes),
        }
    }

    /// Closes the open transaction, returning its changes.
    pub(crate) async fn take(&self) -> Option<Vec<Change>> {
        self.0.lock().await.take()
    }

    pub(crate) async fn is_open(&self) -> bool {
        self.0.lock().await.is_some()
    }
}

/// Members of a member-like value; the keys for hashes, members for sorted sets.
fn members_of(value: Value) -> Vec<String> {
    match value {
        Value::Hash(hash) => hash.into_keys().collect(),
        Value::SortedSet(entries) => entries.into_iter().map(|(_, m)| m).collect(),
        other => other.into_members().unwrap_or_default(),
    }
}

/// Commands that insert `value` into the collection at `path`.
fn insert_commands(path: String, value_type: ValueType, value: Value) -> Vec<Command> {
    match (value_type, value) {
        (ValueType::Hash, Value::Hash(hash)) if !hash.is_empty() => vec![Command::HSet {
            key: path,
            fields: hash.into_iter().collect(),
        }],
        (ValueType::SortedSet, Value::SortedSet(entries)) if !entries.is_empty() => {
            vec![Command::ZAdd { key: path, entries }]
        }
        (ValueType::List, value) => match value.into_members() {
            Some(values) if !values.is_empty() => vec![Command::RPush { key: path, values }],
            _ => Vec::new(),
        },
        (ValueType::Set, value) => match value.into_members() {
            Some(members) if !members.is_empty() => vec![Command::SAdd { key: path, members }],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Pending scalar writes per record hash: field -> new text, `None` deletes.
type ScalarWrites = BTreeMap<String, BTreeMap<String, Option<String>>>;

fn flush_scalars(scalars: &mut ScalarWrites, commands: &mut Vec<Command>) {
    for (path, fields) in std::mem::take(scalars) {
        let mut writes = Vec::new();
        let mut deletes = Vec::new();
        for (field, value) in fields {
            match value {
                Some(value) => writes.push((field, value)),
                None => deletes.push(field),
            }
        }
        if !writes.is_empty() {
            commands.push(Command::HSet {
                key: path.clone(),
                fields: writes,
            });
        }
        if !deletes.is_empty() {
            commands.push(Command::HDel {
                key: path,
                fields: deletes,
            });
        }
    }
}

/// Translates a change set into one batch of native commands.
///
/// Scalar writes to the same record hash are coalesced into one multi-field write and one
/// multi-field delete, where the last write of a field wins. Pending scalar writes are
/// flushed before every purge, so purges keep their position relative to them.
pub(crate) async fn plan(store: &dyn Store, changes: Vec<Change>) -> LinkResult<Vec<Command>> {
    let mut commands = Vec::new();
    let mut scalars = ScalarWrites::new();
    // paths written by this batch, which a later purge must also remove
    let mut touched = BTreeSet::new();

    for change in changes {
        match change {
            Change::Purge { namespace, id } => {
                flush_scalars(&mut scalars, &mut commands);
                let prefix = Key::record_prefix(&namespace, &id);
                let mut keys: BTreeSet<String> = store.keys(&prefix).await?.into_iter().collect();
                keys.extend(touched.iter().filter(|p: &&String| p.starts_with(&prefix)).cloned());
                if !keys.is_empty() {
                    commands.push(Command::Del {
                        keys: keys.into_iter().collect(),
                    });
                }
            }
            Change::Set { key, value } if !key.is_collection() => {
                let encoded = value.map(|v| v.encode_scalar()).transpose()?;
                let path = key.path();
                touched.insert(path.clone());
                scalars
                    .entry(path)
                    .or_default()
                    .insert(key.name().to_owned(), encoded);
            }
            Change::Clear { key } if !key.is_collection() => {
                let path = key.path();
                touched.insert(path.clone());
                scalars
                    .entry(path)
                    .or_default()
                    .insert(key.name().to_owned(), None);
            }
            Change::Add { key, value } => {
                let path = key.path();
                touched.insert(path.clone());
                commands.extend(insert_commands(path, key.value_type(), value));
            }
            Change::Delete { key, value } => {
                let path = key.path();
                let members = members_of(value);
                if members.is_empty() {
                    continue;
                }
                match key.value_type() {
                    ValueType::Set => commands.push(Command::SRem { key: path, members }),
                    ValueType::SortedSet => commands.push(Command::ZRem { key: path, members }),
                    ValueType::Hash => commands.push(Command::HDel {
                        key: path,
                        fields: members,
                    }),
                    _ => commands.extend(members.into_iter().map(|value| Command::LRem {
                        key: path.clone(),
                        value,
                    })),
                }
            }
            Change::Move { key, value, to } => {
                let from = key.path();
                let to = to.path();
                touched.insert(to.clone());
                match value {
                    Value::Hash(hash) => {
                        if hash.is_empty() {
                            continue;
                        }
                        commands.push(Command::HDel {
                            key: from,
                            fields: hash.keys().cloned().collect(),
                        });
                        commands.push(Command::HSet {
                            key: to,
                            fields: hash.into_iter().collect(),
                        });
                    }
                    other => {
                        commands.extend(other.into_members().unwrap_or_default().into_iter().map(
                            |member| Command::SMove {
                                from: from.clone(),
                                to: to.clone(),
                                member,
                            },
                        ));
                    }
                }
            }
            Change::Clear { key } => commands.push(Command::Del {
                keys: vec![key.path()],
            }),
            Change::Set { key, value } => {
                let path = key.path();
                commands.push(Command::Del {
                    keys: vec![path.clone()],
                });
                if let Some(value) = value {
                    touched.insert(path.clone());
                    commands.extend(insert_commands(path, key.value_type(), value));
                }
            }
        }
    }

    flush_scalars(&mut scalars, &mut commands);
    Ok(commands)
}
