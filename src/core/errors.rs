use std::{num::ParseFloatError, num::ParseIntError, str::Utf8Error};

use itertools::Itertools;

use crate::core::ValueType;

#[derive(Debug, Display, Error, From)]
pub enum DecodeError {
    #[display("Invalid integer: {}", _0)]
    InvalidInteger(ParseIntError),
    #[display("Invalid float: {}", _0)]
    InvalidFloat(ParseFloatError),
    #[from(skip)]
    #[display("Invalid boolean: '{}'", _0)]
    InvalidBoolean(#[error(not(source))] String),
    #[from(skip)]
    #[display("Invalid timestamp: '{}'", _0)]
    InvalidTimestamp(#[error(not(source))] String),
    #[display("Invalid escape sequence: {}", _0)]
    Utf8Error(Utf8Error),
    #[from(skip)]
    #[display("Values of type {} are not stored as text", _0)]
    NotScalar(#[error(not(source))] ValueType),
}

/// Errors raised by a [`Store`] implementation. Surfaced to callers unmasked.
///
/// [`Store`]: crate::kv::Store
#[derive(Debug, Clone, PartialEq, Display, Error)]
pub enum StoreError {
    #[display("WRONGTYPE: key '{key}' does not hold a {expected}")]
    WrongType { key: String, expected: &'static str },
    #[display("Store unavailable: {}", _0)]
    Unavailable(#[error(not(source))] String),
}

#[derive(Debug, Display, Error, From)]
pub enum LinkError {
    // -- Caller Errors --
    #[from(skip)]
    #[display("Validation error: {}", _0)]
    Validation(#[error(not(source))] String),
    #[from(skip)]
    #[display("Configuration error: {}", _0)]
    Configuration(#[error(not(source))] String),
    #[from(skip)]
    #[display("Unsupported operation: {}", _0)]
    Unsupported(#[error(not(source))] String),

    // -- Locking Errors --
    #[from(skip)]
    #[display(
        "Currently locking [{}], cannot lock different set [{}]",
        held.iter().join(", "), requested.iter().join(", "),
    )]
    AlreadyLocking {
        held: Vec<String>,
        requested: Vec<String>,
    },
    #[from(skip)]
    #[display("Timed out acquiring lock for namespace '{namespace}' after {waited_ms}ms")]
    LockTimeout { namespace: String, waited_ms: u64 },
    #[from(skip)]
    #[display("Lost lock lease '{key}', it expired or was taken over")]
    LockLost { key: String },

    // -- Lower Layers --
    #[display("Store error: {}", _0)]
    Store(StoreError),
    #[display("Decode error: {}", _0)]
    Decode(DecodeError),
}

impl LinkError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub(crate) fn shape_mismatch(expected: ValueType, found: ValueType) -> Self {
        Self::Validation(format!(
            "value of type {} does not fit a key of type {}",
            found, expected
        ))
    }

    /// Returns `true` for lock conflicts, timeouts and lost leases.
    pub fn is_concurrency(&self) -> bool {
        matches!(
            self,
            Self::AlreadyLocking { .. } | Self::LockTimeout { .. } | Self::LockLost { .. }
        )
    }
}

pub type LinkResult<T> = Result<T, LinkError>;
pub type StoreResult<T> = Result<T, StoreError>;
