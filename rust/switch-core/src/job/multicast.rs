// rust/switch-core/src/job/multicast.rs

//! Multicast group membership.
//!
//! A group entry lists node ids; each node entry carries the replication id
//! and the device port a copy is sent out of. Node ids are derived from the
//! group and the rid, so the same worker always maps to the same node and a
//! node left behind by a crashed run is found again on restart.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::dataplane::schema::{action, action::param, field};
use crate::dataplane::{ActionData, FieldValue, TableId, TableKey, TableOps};
use crate::error::{ControlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastNode {
    pub rid: u16,
    pub node_id: u32,
    pub dev_port: u16,
}

pub fn node_id(group_id: u16, rid: u16) -> u32 {
    (u32::from(group_id) << 16) | u32::from(rid)
}

fn group_key(group_id: u16) -> TableKey {
    TableKey::new().exact(field::MGID, u64::from(group_id))
}

fn node_key(node_id: u32) -> TableKey {
    TableKey::new().exact(field::NODE_ID, u64::from(node_id))
}

fn group_data(node_ids: &[u32]) -> ActionData {
    ActionData::new(action::NONE)
        .list(param::NODE_IDS, node_ids.iter().map(|id| u64::from(*id)).collect())
        .flags(param::L1_XID_VALID, vec![false; node_ids.len()])
        .list(param::L1_XIDS, vec![0; node_ids.len()])
}

fn node_data(rid: u16, dev_port: u16) -> ActionData {
    ActionData::new(action::NONE)
        .param(param::RID, u64::from(rid))
        .list(param::DEV_PORTS, vec![u64::from(dev_port)])
}

/// Keeps multicast groups in the switch in step with a local index of their
/// members (`rid -> node`), so removals never need a lookup in the switch.
#[derive(Debug, Default)]
pub struct MulticastGroupManager {
    groups: BTreeMap<u16, BTreeMap<u16, MulticastNode>>,
}

impl MulticastGroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `group_id` empty. A group left by an earlier run is deleted
    /// together with its nodes first, since the switch has no way to empty a
    /// group in place.
    pub async fn ensure_group(&mut self, ops: &TableOps, group_id: u16) -> Result<()> {
        let key = group_key(group_id);
        let existing = ops
            .entries(TableId::PreMgid)
            .await?
            .into_iter()
            .find(|entry| entry.key == key);

        if let Some(entry) = existing {
            let stale: Vec<u64> = entry
                .data
                .get(param::NODE_IDS)
                .and_then(FieldValue::as_list)
                .map(<[u64]>::to_vec)
                .unwrap_or_default();
            warn!(
                "Multicast group {:#x} already exists with {} nodes; recreating it",
                group_id,
                stale.len()
            );
            ops.remove(TableId::PreMgid, &key).await?;
            for node in stale {
                ops.remove(TableId::PreNode, &TableKey::new().exact(field::NODE_ID, node))
                    .await?;
            }
        }

        // Nodes of this group that never made it into the group entry.
        let orphans = ops
            .purge(TableId::PreNode, |entry| {
                entry
                    .key
                    .get(field::NODE_ID)
                    .is_some_and(|id| id >> 16 == u64::from(group_id))
            })
            .await?;
        if orphans > 0 {
            warn!("Removed {} orphaned nodes of multicast group {:#x}", orphans, group_id);
        }

        ops.install(TableId::PreMgid, &key, &group_data(&[])).await?;
        self.groups.insert(group_id, BTreeMap::new());
        info!("Multicast group {:#x} ready", group_id);
        Ok(())
    }

    fn members_mut(&mut self, group_id: u16) -> Result<&mut BTreeMap<u16, MulticastNode>> {
        self.groups
            .get_mut(&group_id)
            .ok_or_else(|| ControlError::not_found(format!("multicast group {:#x}", group_id)))
    }

    /// Adds a node for `rid`. Adding a rid that is already a member only logs
    /// a warning.
    pub async fn add_node(&mut self, ops: &TableOps, group_id: u16, rid: u16, dev_port: u16) -> Result<()> {
        let members = self.members_mut(group_id)?;
        if let Some(existing) = members.get(&rid) {
            warn!(
                "rid {:#x} is already in multicast group {:#x} on port {}; ignoring add for port {}",
                rid, group_id, existing.dev_port, dev_port
            );
            return Ok(());
        }

        let node = MulticastNode {
            rid,
            node_id: node_id(group_id, rid),
            dev_port,
        };
        ops.install(TableId::PreNode, &node_key(node.node_id), &node_data(rid, dev_port))
            .await?;

        let mut ids: Vec<u32> = members.values().map(|n| n.node_id).collect();
        ids.push(node.node_id);
        if let Err(e) = ops.modify(TableId::PreMgid, &group_key(group_id), &group_data(&ids)).await {
            if let Err(cleanup) = ops.remove(TableId::PreNode, &node_key(node.node_id)).await {
                warn!("Failed to remove node {:#x} after failed add: {}", node.node_id, cleanup);
            }
            return Err(e);
        }

        members.insert(rid, node);
        debug!("Added rid {:#x} on port {} to multicast group {:#x}", rid, dev_port, group_id);
        Ok(())
    }

    /// Removes the node for `rid`, returning the device port it pointed at.
    /// An absent rid (or group) is not an error.
    pub async fn remove_node(&mut self, ops: &TableOps, group_id: u16, rid: u16) -> Result<Option<u16>> {
        let Some(members) = self.groups.get_mut(&group_id) else {
            return Ok(None);
        };
        let Some(node) = members.get(&rid).copied() else {
            debug!("rid {:#x} is not in multicast group {:#x}", rid, group_id);
            return Ok(None);
        };

        let ids: Vec<u32> = members
            .values()
            .filter(|n| n.rid != rid)
            .map(|n| n.node_id)
            .collect();
        ops.modify(TableId::PreMgid, &group_key(group_id), &group_data(&ids)).await?;
        ops.remove(TableId::PreNode, &node_key(node.node_id)).await?;

        members.remove(&rid);
        debug!("Removed rid {:#x} from multicast group {:#x}", rid, group_id);
        Ok(Some(node.dev_port))
    }

    /// Removes every node this manager added to `group_id`. The group itself
    /// stays in place for the next job.
    pub async fn clear_all(&mut self, ops: &TableOps, group_id: u16) -> Result<usize> {
        let Some(members) = self.groups.get_mut(&group_id) else {
            return Ok(0);
        };

        ops.modify(TableId::PreMgid, &group_key(group_id), &group_data(&[])).await?;
        for node in members.values() {
            ops.remove(TableId::PreNode, &node_key(node.node_id)).await?;
        }

        let removed = members.len();
        members.clear();
        debug!("Cleared {} nodes from multicast group {:#x}", removed, group_id);
        Ok(removed)
    }

    pub fn members(&self, group_id: u16) -> Vec<MulticastNode> {
        self.groups
            .get(&group_id)
            .map(|m| m.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn dev_port(&self, group_id: u16, rid: u16) -> Option<u16> {
        self.groups.get(&group_id)?.get(&rid).map(|n| n.dev_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::{Fault, MemoryDataplane, TableClient};
    use crate::retry::RetryConfig;
    use std::sync::Arc;
    use std::time::Duration;

    const GROUP: u16 = 0x1234;

    fn setup() -> (Arc<MemoryDataplane>, TableOps) {
        let dp = Arc::new(MemoryDataplane::new());
        let ops = TableOps::new(dp.clone(), RetryConfig::no_retry(), Duration::from_secs(1));
        (dp, ops)
    }

    async fn group_nodes(dp: &MemoryDataplane, group_id: u16) -> Vec<u64> {
        dp.get_entries(TableId::PreMgid)
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.key == group_key(group_id))
            .and_then(|e| e.data.get(param::NODE_IDS).and_then(FieldValue::as_list).map(<[u64]>::to_vec))
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_and_remove_nodes() {
        let (dp, ops) = setup();
        let mut manager = MulticastGroupManager::new();
        manager.ensure_group(&ops, GROUP).await.unwrap();

        manager.add_node(&ops, GROUP, 0, 4).await.unwrap();
        manager.add_node(&ops, GROUP, 1, 8).await.unwrap();
        assert_eq!(group_nodes(&dp, GROUP).await, vec![0x1234_0000, 0x1234_0001]);
        assert_eq!(dp.entry_count(TableId::PreNode).await, 2);

        assert_eq!(manager.remove_node(&ops, GROUP, 0).await.unwrap(), Some(4));
        assert_eq!(group_nodes(&dp, GROUP).await, vec![0x1234_0001]);
        assert_eq!(dp.entry_count(TableId::PreNode).await, 1);
    }

    #[tokio::test]
    async fn test_add_node_is_idempotent() {
        let (dp, ops) = setup();
        let mut manager = MulticastGroupManager::new();
        manager.ensure_group(&ops, GROUP).await.unwrap();

        manager.add_node(&ops, GROUP, 3, 12).await.unwrap();
        manager.add_node(&ops, GROUP, 3, 12).await.unwrap();

        assert_eq!(manager.members(GROUP).len(), 1);
        assert_eq!(group_nodes(&dp, GROUP).await.len(), 1);
        assert_eq!(dp.entry_count(TableId::PreNode).await, 1);
    }

    #[tokio::test]
    async fn test_remove_absent_node() {
        let (_dp, ops) = setup();
        let mut manager = MulticastGroupManager::new();
        assert_eq!(manager.remove_node(&ops, GROUP, 1).await.unwrap(), None);
        manager.ensure_group(&ops, GROUP).await.unwrap();
        assert_eq!(manager.remove_node(&ops, GROUP, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_to_unknown_group() {
        let (_dp, ops) = setup();
        let mut manager = MulticastGroupManager::new();
        let err = manager.add_node(&ops, GROUP, 0, 4).await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn test_clear_all_keeps_group() {
        let (dp, ops) = setup();
        let mut manager = MulticastGroupManager::new();
        manager.ensure_group(&ops, GROUP).await.unwrap();
        for rid in 0..4 {
            manager.add_node(&ops, GROUP, rid, 4 * rid + 4).await.unwrap();
        }

        assert_eq!(manager.clear_all(&ops, GROUP).await.unwrap(), 4);
        assert!(group_nodes(&dp, GROUP).await.is_empty());
        assert_eq!(dp.entry_count(TableId::PreNode).await, 0);
        assert!(manager.members(GROUP).is_empty());

        // Clearing again is a no-op.
        assert_eq!(manager.clear_all(&ops, GROUP).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ensure_group_recreates_leftover_group() {
        let (dp, ops) = setup();
        {
            // A previous controller run left a populated group behind.
            let mut previous = MulticastGroupManager::new();
            previous.ensure_group(&ops, GROUP).await.unwrap();
            previous.add_node(&ops, GROUP, 0, 4).await.unwrap();
            previous.add_node(&ops, GROUP, 1, 8).await.unwrap();
        }

        let mut manager = MulticastGroupManager::new();
        manager.ensure_group(&ops, GROUP).await.unwrap();
        assert!(group_nodes(&dp, GROUP).await.is_empty());
        assert_eq!(dp.entry_count(TableId::PreNode).await, 0);
        assert!(manager.members(GROUP).is_empty());
    }

    #[tokio::test]
    async fn test_groups_do_not_share_nodes() {
        let (dp, ops) = setup();
        let mut manager = MulticastGroupManager::new();
        manager.ensure_group(&ops, GROUP).await.unwrap();
        manager.ensure_group(&ops, GROUP + 1).await.unwrap();
        manager.add_node(&ops, GROUP, 2, 4).await.unwrap();
        manager.add_node(&ops, GROUP + 1, 2, 4).await.unwrap();

        manager.clear_all(&ops, GROUP).await.unwrap();
        assert_eq!(group_nodes(&dp, GROUP + 1).await, vec![u64::from(node_id(GROUP + 1, 2))]);
        assert_eq!(manager.dev_port(GROUP + 1, 2), Some(4));
    }

    #[tokio::test]
    async fn test_failed_group_update_removes_new_node() {
        let (dp, ops) = setup();
        let mut manager = MulticastGroupManager::new();
        manager.ensure_group(&ops, GROUP).await.unwrap();

        dp.inject_fault(Some(TableId::PreMgid), Fault::Unavailable, 1).await;
        let err = manager.add_node(&ops, GROUP, 5, 20).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(dp.entry_count(TableId::PreNode).await, 0);
        assert!(manager.members(GROUP).is_empty());

        // The same call succeeds once the dataplane recovers.
        manager.add_node(&ops, GROUP, 5, 20).await.unwrap();
        assert_eq!(manager.members(GROUP).len(), 1);
    }
}
