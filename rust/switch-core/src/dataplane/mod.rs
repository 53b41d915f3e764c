// rust/switch-core/src/dataplane/mod.rs

//! Access to the switch's match-action tables, registers and multicast
//! engine.

pub mod memory;
pub mod ops;
pub mod schema;
pub mod traits;

pub use memory::{Fault, MemoryDataplane, OpKind, Operation};
pub use ops::TableOps;
pub use schema::{Schema, TableId, TableKind, TableSchema, QUEUE_PAIRS_PER_WORKER, REGISTER_SIZE};
pub use traits::{
    ActionData, DataplaneError, DataplaneResult, FieldValue, KeyField, TableClient, TableEntry, TableKey,
};
