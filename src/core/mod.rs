pub mod encoding;
pub mod errors;
pub mod key;
pub mod value;

pub use encoding::{escape_name, index_keys, unescape_name};
pub use errors::{DecodeError, LinkError, LinkResult, StoreError, StoreResult};
pub use key::{Key, StorageKind};
pub use value::{Value, ValueType};
