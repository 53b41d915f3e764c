// rust/switch-core/src/dataplane/traits.rs

//! Table-programming abstraction for the switch dataplane.
//!
//! The controller never talks to switch hardware directly. Every component
//! composes a [`TableClient`], a narrow async capability exposing the
//! operations of the switch's runtime RPC: match-action entries, indexed
//! registers and counters.

use async_trait::async_trait;
use thiserror::Error;

use super::schema::TableId;

/// Error reported by a dataplane implementation for a single call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataplaneError {
    /// The key (or register index) does not exist.
    #[error("entry not found")]
    NotFound,

    /// An entry with the same key already exists.
    #[error("entry already exists")]
    AlreadyExists,

    /// Transport-level failure; the call may be repeated.
    #[error("dataplane unavailable: {message}")]
    Unavailable { message: String },

    /// The call did not complete within the configured deadline.
    #[error("dataplane call timed out")]
    Timeout,

    /// The request does not match the table schema or its limits.
    #[error("request rejected: {message}")]
    Rejected { message: String },
}

impl DataplaneError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Transport failures are worth repeating; everything else is a definitive answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout)
    }
}

pub type DataplaneResult<T> = std::result::Result<T, DataplaneError>;

/// One key field of a match-action entry.
///
/// Exact-match fields carry a full mask; ternary fields carry the mask
/// supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyField {
    pub name: &'static str,
    pub value: u64,
    pub mask: u64,
}

/// Key of a match-action entry. Fields are kept sorted by name so that two
/// keys built in a different order compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableKey {
    fields: Vec<KeyField>,
}

impl TableKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an exact-match field.
    #[must_use]
    pub fn exact(self, name: &'static str, value: u64) -> Self {
        self.ternary(name, value, u64::MAX)
    }

    /// Adds a ternary field. The stored value is pre-masked.
    #[must_use]
    pub fn ternary(mut self, name: &'static str, value: u64, mask: u64) -> Self {
        self.fields.retain(|f| f.name != name);
        self.fields.push(KeyField {
            name,
            value: value & mask,
            mask,
        });
        self.fields.sort();
        self
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.value)
    }
}

/// Value of an action parameter or data field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(u64),
    IntList(Vec<u64>),
    BoolList(Vec<bool>),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[u64]> {
        match self {
            Self::IntList(v) => Some(v),
            _ => None,
        }
    }
}

/// Action and parameters attached to an entry. Tables without actions
/// (multicast group and node tables) use an empty action name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionData {
    pub action: &'static str,
    pub params: Vec<(&'static str, FieldValue)>,
}

impl ActionData {
    pub fn new(action: &'static str) -> Self {
        Self {
            action,
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn param(mut self, name: &'static str, value: u64) -> Self {
        self.params.push((name, FieldValue::Int(value)));
        self
    }

    #[must_use]
    pub fn list(mut self, name: &'static str, values: Vec<u64>) -> Self {
        self.params.push((name, FieldValue::IntList(values)));
        self
    }

    #[must_use]
    pub fn flags(mut self, name: &'static str, values: Vec<bool>) -> Self {
        self.params.push((name, FieldValue::BoolList(values)));
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.params.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn get_int(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(FieldValue::as_int)
    }
}

/// An installed entry as read back from the dataplane, including the
/// direct counters attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub key: TableKey,
    pub data: ActionData,
    pub packets: u64,
    pub bytes: u64,
}

/// Capability interface over the switch's table-programming RPC.
///
/// Implementations report conditions precisely (`NotFound`,
/// `AlreadyExists`); the idempotent call-site policy lives in
/// [`super::TableOps`], not here.
#[async_trait]
pub trait TableClient: Send + Sync {
    /// Names of every table the loaded switch program exposes.
    async fn table_names(&self) -> DataplaneResult<Vec<String>>;

    /// Installs a new entry. Fails with `AlreadyExists` if the key is present.
    async fn add_entry(&self, table: TableId, key: &TableKey, data: &ActionData) -> DataplaneResult<()>;

    /// Replaces the action data of an existing entry, resetting its counters.
    async fn modify_entry(&self, table: TableId, key: &TableKey, data: &ActionData) -> DataplaneResult<()>;

    /// Deletes an entry. Fails with `NotFound` if the key is absent.
    async fn delete_entry(&self, table: TableId, key: &TableKey) -> DataplaneResult<()>;

    /// Returns every entry in the table.
    async fn get_entries(&self, table: TableId) -> DataplaneResult<Vec<TableEntry>>;

    /// Deletes every entry in the table.
    async fn clear_table(&self, table: TableId) -> DataplaneResult<()>;

    /// Refreshes the software copy of direct counters from hardware.
    async fn sync_counters(&self, table: TableId) -> DataplaneResult<()>;

    /// Reads `count` consecutive register (or indexed counter) cells
    /// starting at `start`. Every cell has one value per register field.
    async fn read_register(&self, table: TableId, start: u32, count: u32) -> DataplaneResult<Vec<Vec<u64>>>;

    /// Writes one register cell.
    async fn write_register(&self, table: TableId, index: u32, values: &[u64]) -> DataplaneResult<()>;

    /// Resets every cell of a register or indexed counter to zero.
    async fn reset_register(&self, table: TableId) -> DataplaneResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_order_is_canonical() {
        let a = TableKey::new().exact("b", 1).exact("a", 2);
        let b = TableKey::new().exact("a", 2).exact("b", 1);
        assert_eq!(a, b);
        assert_eq!(a.fields()[0].name, "a");
    }

    #[test]
    fn test_ternary_value_is_masked() {
        let key = TableKey::new().ternary("hdr.udp.dst_port", 0xbee7, 0xfff0);
        assert_eq!(key.get("hdr.udp.dst_port"), Some(0xbee0));
    }

    #[test]
    fn test_repeated_field_replaces_previous() {
        let key = TableKey::new().exact("x", 1).exact("x", 2);
        assert_eq!(key.fields().len(), 1);
        assert_eq!(key.get("x"), Some(2));
    }

    #[test]
    fn test_transient_errors() {
        assert!(DataplaneError::Timeout.is_transient());
        assert!(DataplaneError::unavailable("reset by peer").is_transient());
        assert!(!DataplaneError::NotFound.is_transient());
        assert!(!DataplaneError::rejected("bad").is_transient());
    }
}
