// rust/switch-core/src/dataplane/memory.rs

//! In-process dataplane.
//!
//! `MemoryDataplane` keeps tables, registers and counters in memory and
//! enforces the same rules the switch runtime does: keys and action data must
//! match the table schema, tables have a fixed capacity, register indices are
//! bounded, and multicast groups may only reference existing nodes. It backs
//! the controller's `memory` backend and every test in this crate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::schema::{action::param, MatchKind, TableId, TableKind, TableSchema};
use super::traits::{
    ActionData, DataplaneError, DataplaneResult, FieldValue, TableClient, TableEntry, TableKey,
};

/// Failure injected into subsequent calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The call fails with `Unavailable` without touching any state.
    Unavailable,
    /// The call stalls for the given duration before executing.
    Hang(Duration),
}

/// Kind of a recorded dataplane call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    TableNames,
    Add,
    Modify,
    Delete,
    Get,
    Clear,
    SyncCounters,
    ReadRegister,
    WriteRegister,
    ResetRegister,
}

impl OpKind {
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Modify | Self::Delete | Self::Clear | Self::WriteRegister | Self::ResetRegister
        )
    }
}

/// One call that reached the dataplane state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub table: Option<TableId>,
    pub kind: OpKind,
}

#[derive(Debug)]
struct FaultRule {
    table: Option<TableId>,
    fault: Fault,
    remaining: u32,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    data: ActionData,
    packets: u64,
    bytes: u64,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<TableId, BTreeMap<TableKey, StoredEntry>>,
    registers: HashMap<TableId, BTreeMap<u32, Vec<u64>>>,
    hidden: HashSet<TableId>,
    faults: Vec<FaultRule>,
    log: Vec<Operation>,
}

/// In-memory implementation of [`TableClient`].
#[derive(Debug, Default)]
pub struct MemoryDataplane {
    state: RwLock<State>,
}

impl MemoryDataplane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the table disappear from `table_names`, as if the loaded switch
    /// program did not define it.
    pub async fn hide_table(&self, table: TableId) {
        self.state.write().await.hidden.insert(table);
    }

    /// Injects `fault` into the next `times` calls on `table` (or on any table).
    pub async fn inject_fault(&self, table: Option<TableId>, fault: Fault, times: u32) {
        self.state.write().await.faults.push(FaultRule {
            table,
            fault,
            remaining: times,
        });
    }

    pub async fn clear_faults(&self) {
        self.state.write().await.faults.clear();
    }

    /// Every call that passed fault injection, oldest first.
    pub async fn operations(&self) -> Vec<Operation> {
        self.state.read().await.log.clone()
    }

    pub async fn clear_operations(&self) {
        self.state.write().await.log.clear();
    }

    pub async fn entry_count(&self, table: TableId) -> usize {
        self.state.read().await.tables.get(&table).map_or(0, BTreeMap::len)
    }

    /// Adds traffic to the direct counters of an installed entry.
    pub async fn bump_counter(&self, table: TableId, key: &TableKey, packets: u64, bytes: u64) -> DataplaneResult<()> {
        let mut state = self.state.write().await;
        let entry = state
            .tables
            .get_mut(&table)
            .and_then(|t| t.get_mut(key))
            .ok_or(DataplaneError::NotFound)?;
        entry.packets += packets;
        entry.bytes += bytes;
        Ok(())
    }

    async fn enter(&self, table: Option<TableId>, kind: OpKind) -> DataplaneResult<()> {
        let fault = {
            let mut state = self.state.write().await;
            let fault = state
                .faults
                .iter_mut()
                .find(|rule| rule.remaining > 0 && (rule.table.is_none() || rule.table == table))
                .map(|rule| {
                    rule.remaining -= 1;
                    rule.fault
                });
            state.faults.retain(|rule| rule.remaining > 0);
            fault
        };

        match fault {
            Some(Fault::Unavailable) => {
                debug!("Injected unavailable fault on {:?} {:?}", kind, table);
                return Err(DataplaneError::unavailable("injected fault"));
            }
            Some(Fault::Hang(duration)) => {
                debug!("Injected {:?} stall on {:?} {:?}", duration, kind, table);
                tokio::time::sleep(duration).await;
            }
            None => {}
        }

        self.state.write().await.log.push(Operation { table, kind });
        Ok(())
    }
}

fn expect_kind(table: TableId, indexed: bool) -> DataplaneResult<&'static TableSchema> {
    let schema = table.schema();
    if schema.is_indexed() != indexed {
        let wanted = if indexed { "register" } else { "match" };
        return Err(DataplaneError::rejected(format!("'{}' is not a {} table", schema.name, wanted)));
    }
    Ok(schema)
}

fn check_key(schema: &TableSchema, key: &TableKey) -> DataplaneResult<()> {
    for f in key.fields() {
        let Some(field) = schema.key(f.name) else {
            return Err(DataplaneError::rejected(format!(
                "'{}' has no key field '{}'",
                schema.name, f.name
            )));
        };
        if field.match_kind == MatchKind::Exact && f.mask != u64::MAX {
            return Err(DataplaneError::rejected(format!(
                "key field '{}' of '{}' is exact-match",
                f.name, schema.name
            )));
        }
    }
    for field in schema.keys.iter().filter(|k| k.match_kind == MatchKind::Exact) {
        if key.get(field.name).is_none() {
            return Err(DataplaneError::rejected(format!(
                "missing exact key field '{}' for '{}'",
                field.name, schema.name
            )));
        }
    }
    Ok(())
}

fn check_data(schema: &TableSchema, data: &ActionData) -> DataplaneResult<()> {
    let Some(action) = schema.action(data.action) else {
        return Err(DataplaneError::rejected(format!(
            "'{}' has no action '{}'",
            schema.name, data.action
        )));
    };
    let supplied: HashSet<&str> = data.params.iter().map(|(n, _)| *n).collect();
    let declared: HashSet<&str> = action.params.iter().copied().collect();
    if supplied.len() != data.params.len() || supplied != declared {
        return Err(DataplaneError::rejected(format!(
            "action '{}' of '{}' expects parameters {:?}",
            data.action, schema.name, action.params
        )));
    }
    Ok(())
}

fn list_len(data: &ActionData, name: &str) -> usize {
    match data.get(name) {
        Some(FieldValue::IntList(v)) => v.len(),
        Some(FieldValue::BoolList(v)) => v.len(),
        _ => 0,
    }
}

impl State {
    /// Multicast groups may only reference existing nodes, and the three
    /// member arrays must be the same length.
    fn check_group(&self, data: &ActionData) -> DataplaneResult<()> {
        let nodes = data
            .get(param::NODE_IDS)
            .and_then(FieldValue::as_list)
            .ok_or_else(|| DataplaneError::rejected("multicast group without node list"))?;
        if list_len(data, param::L1_XID_VALID) != nodes.len() || list_len(data, param::L1_XIDS) != nodes.len() {
            return Err(DataplaneError::rejected("multicast group member arrays differ in length"));
        }
        let existing = self.tables.get(&TableId::PreNode);
        for node in nodes {
            let key = TableKey::new().exact(super::schema::field::NODE_ID, *node);
            if !existing.is_some_and(|t| t.contains_key(&key)) {
                return Err(DataplaneError::rejected(format!("multicast node {:#x} does not exist", node)));
            }
        }
        Ok(())
    }

    fn node_in_use(&self, node_id: u64) -> bool {
        self.tables.get(&TableId::PreMgid).is_some_and(|groups| {
            groups.values().any(|g| {
                g.data
                    .get(param::NODE_IDS)
                    .and_then(FieldValue::as_list)
                    .is_some_and(|ids| ids.contains(&node_id))
            })
        })
    }
}

#[async_trait]
impl TableClient for MemoryDataplane {
    async fn table_names(&self) -> DataplaneResult<Vec<String>> {
        self.enter(None, OpKind::TableNames).await?;
        let state = self.state.read().await;
        Ok(TableId::ALL
            .iter()
            .filter(|id| !state.hidden.contains(id))
            .map(|id| id.name().to_string())
            .collect())
    }

    async fn add_entry(&self, table: TableId, key: &TableKey, data: &ActionData) -> DataplaneResult<()> {
        self.enter(Some(table), OpKind::Add).await?;
        let schema = expect_kind(table, false)?;
        check_key(schema, key)?;
        check_data(schema, data)?;

        let mut state = self.state.write().await;
        if schema.kind == TableKind::MulticastGroup {
            state.check_group(data)?;
        }
        let entries = state.tables.entry(table).or_default();
        if entries.contains_key(key) {
            return Err(DataplaneError::AlreadyExists);
        }
        if entries.len() >= schema.size as usize {
            return Err(DataplaneError::rejected(format!("'{}' is full", schema.name)));
        }
        entries.insert(
            key.clone(),
            StoredEntry {
                data: data.clone(),
                packets: 0,
                bytes: 0,
            },
        );
        Ok(())
    }

    async fn modify_entry(&self, table: TableId, key: &TableKey, data: &ActionData) -> DataplaneResult<()> {
        self.enter(Some(table), OpKind::Modify).await?;
        let schema = expect_kind(table, false)?;
        check_key(schema, key)?;
        check_data(schema, data)?;

        let mut state = self.state.write().await;
        if schema.kind == TableKind::MulticastGroup {
            state.check_group(data)?;
        }
        let entry = state
            .tables
            .get_mut(&table)
            .and_then(|t| t.get_mut(key))
            .ok_or(DataplaneError::NotFound)?;
        *entry = StoredEntry {
            data: data.clone(),
            packets: 0,
            bytes: 0,
        };
        Ok(())
    }

    async fn delete_entry(&self, table: TableId, key: &TableKey) -> DataplaneResult<()> {
        self.enter(Some(table), OpKind::Delete).await?;
        let schema = expect_kind(table, false)?;
        check_key(schema, key)?;

        let mut state = self.state.write().await;
        if schema.kind == TableKind::MulticastNode {
            if let Some(node_id) = key.get(super::schema::field::NODE_ID) {
                if state.node_in_use(node_id) {
                    return Err(DataplaneError::rejected(format!(
                        "multicast node {:#x} is still a group member",
                        node_id
                    )));
                }
            }
        }
        state
            .tables
            .get_mut(&table)
            .and_then(|t| t.remove(key))
            .map(|_| ())
            .ok_or(DataplaneError::NotFound)
    }

    async fn get_entries(&self, table: TableId) -> DataplaneResult<Vec<TableEntry>> {
        self.enter(Some(table), OpKind::Get).await?;
        expect_kind(table, false)?;

        let state = self.state.read().await;
        Ok(state
            .tables
            .get(&table)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, stored)| TableEntry {
                        key: key.clone(),
                        data: stored.data.clone(),
                        packets: stored.packets,
                        bytes: stored.bytes,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clear_table(&self, table: TableId) -> DataplaneResult<()> {
        self.enter(Some(table), OpKind::Clear).await?;
        let schema = expect_kind(table, false)?;

        let mut state = self.state.write().await;
        if schema.kind == TableKind::MulticastNode
            && state.tables.get(&TableId::PreMgid).is_some_and(|g| !g.is_empty())
        {
            return Err(DataplaneError::rejected("multicast nodes are still referenced by groups"));
        }
        state.tables.remove(&table);
        Ok(())
    }

    async fn sync_counters(&self, table: TableId) -> DataplaneResult<()> {
        self.enter(Some(table), OpKind::SyncCounters).await?;
        expect_kind(table, false)?;
        Ok(())
    }

    async fn read_register(&self, table: TableId, start: u32, count: u32) -> DataplaneResult<Vec<Vec<u64>>> {
        self.enter(Some(table), OpKind::ReadRegister).await?;
        let schema = expect_kind(table, true)?;
        let end = start
            .checked_add(count)
            .filter(|end| *end <= schema.size)
            .ok_or_else(|| {
                DataplaneError::rejected(format!(
                    "range {}+{} outside '{}' of size {}",
                    start, count, schema.name, schema.size
                ))
            })?;

        let state = self.state.read().await;
        let cells = state.registers.get(&table);
        let zero = vec![0; schema.fields.len()];
        Ok((start..end)
            .map(|index| {
                cells
                    .and_then(|c| c.get(&index))
                    .cloned()
                    .unwrap_or_else(|| zero.clone())
            })
            .collect())
    }

    async fn write_register(&self, table: TableId, index: u32, values: &[u64]) -> DataplaneResult<()> {
        self.enter(Some(table), OpKind::WriteRegister).await?;
        let schema = expect_kind(table, true)?;
        if index >= schema.size {
            return Err(DataplaneError::rejected(format!(
                "index {} outside '{}' of size {}",
                index, schema.name, schema.size
            )));
        }
        if values.len() != schema.fields.len() {
            return Err(DataplaneError::rejected(format!(
                "'{}' cells have {} fields, got {}",
                schema.name,
                schema.fields.len(),
                values.len()
            )));
        }

        let mut state = self.state.write().await;
        let cells = state.registers.entry(table).or_default();
        if values.iter().all(|v| *v == 0) {
            cells.remove(&index);
        } else {
            cells.insert(index, values.to_vec());
        }
        Ok(())
    }

    async fn reset_register(&self, table: TableId) -> DataplaneResult<()> {
        self.enter(Some(table), OpKind::ResetRegister).await?;
        expect_kind(table, true)?;
        self.state.write().await.registers.remove(&table);
        Ok(())
    }
}
