// rust/switch-core/src/dataplane/ops.rs

//! Idempotent call-site policy over a [`TableClient`].
//!
//! Every call gets a deadline and a bounded number of retries for transport
//! failures. Deleting an absent entry counts as success and installing over
//! an existing key replaces it, so a whole multi-step operation can be
//! repeated after a partial failure without special-casing what already ran.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::schema::TableId;
use super::traits::{ActionData, DataplaneError, DataplaneResult, TableClient, TableEntry, TableKey};
use crate::config::DataplaneConfig;
use crate::error::{ControlError, Result};
use crate::retry::{retry_async, RetryConfig, RetryResult};

#[derive(Clone)]
pub struct TableOps {
    client: Arc<dyn TableClient>,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl fmt::Debug for TableOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableOps")
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl TableOps {
    pub fn new(client: Arc<dyn TableClient>, retry: RetryConfig, call_timeout: Duration) -> Self {
        Self {
            client,
            retry,
            call_timeout,
        }
    }

    pub fn from_config(client: Arc<dyn TableClient>, config: &DataplaneConfig) -> Self {
        Self::new(client, RetryConfig::from(config), Duration::from_millis(config.call_timeout_ms))
    }

    /// Runs one dataplane call under the deadline and retry policy.
    async fn call<T, F, Fut>(&self, table: &'static str, operation: &'static str, f: F) -> DataplaneResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DataplaneResult<T>>,
    {
        let deadline = self.call_timeout;
        retry_async(&self.retry, || {
            let fut = f();
            async move {
                match tokio::time::timeout(deadline, fut).await {
                    Ok(Ok(value)) => RetryResult::Ok(value),
                    Ok(Err(e)) if e.is_transient() => {
                        warn!("{} on '{}' failed, retrying: {}", operation, table, e);
                        RetryResult::Retry(e)
                    }
                    Ok(Err(e)) => RetryResult::Fail(e),
                    Err(_) => {
                        warn!("{} on '{}' exceeded {:?}, retrying", operation, table, deadline);
                        RetryResult::Retry(DataplaneError::Timeout)
                    }
                }
            }
        })
        .await
    }

    pub async fn table_names(&self) -> Result<Vec<String>> {
        self.call("$tables", "list", || self.client.table_names())
            .await
            .map_err(|e| ControlError::dataplane("$tables", "list", e))
    }

    /// Installs an entry, replacing any entry already present under the same key.
    pub async fn install(&self, table: TableId, key: &TableKey, data: &ActionData) -> Result<()> {
        debug!("install {} {} {:?}", table, data.action, key.fields());
        match self.call(table.name(), "add", || self.client.add_entry(table, key, data)).await {
            Ok(()) => Ok(()),
            Err(DataplaneError::AlreadyExists) => {
                debug!("Replacing existing entry in {}", table);
                self.remove(table, key).await?;
                self.call(table.name(), "add", || self.client.add_entry(table, key, data))
                    .await
                    .map_err(|e| ControlError::dataplane(table.name(), "add", e))
            }
            Err(e) => Err(ControlError::dataplane(table.name(), "add", e)),
        }
    }

    /// Deletes an entry. Returns `false` if it was already absent.
    pub async fn remove(&self, table: TableId, key: &TableKey) -> Result<bool> {
        debug!("remove {} {:?}", table, key.fields());
        match self.call(table.name(), "delete", || self.client.delete_entry(table, key)).await {
            Ok(()) => Ok(true),
            Err(DataplaneError::NotFound) => Ok(false),
            Err(e) => Err(ControlError::dataplane(table.name(), "delete", e)),
        }
    }

    pub async fn modify(&self, table: TableId, key: &TableKey, data: &ActionData) -> Result<()> {
        debug!("modify {} {} {:?}", table, data.action, key.fields());
        self.call(table.name(), "modify", || self.client.modify_entry(table, key, data))
            .await
            .map_err(|e| ControlError::dataplane(table.name(), "modify", e))
    }

    pub async fn entries(&self, table: TableId) -> Result<Vec<TableEntry>> {
        self.call(table.name(), "get", || self.client.get_entries(table))
            .await
            .map_err(|e| ControlError::dataplane(table.name(), "get", e))
    }

    /// Deletes every entry selected by `select`, returning how many were removed.
    pub async fn purge<P>(&self, table: TableId, select: P) -> Result<usize>
    where
        P: Fn(&TableEntry) -> bool,
    {
        let mut removed = 0;
        for entry in self.entries(table).await? {
            if select(&entry) && self.remove(table, &entry.key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn clear_table(&self, table: TableId) -> Result<()> {
        self.call(table.name(), "clear", || self.client.clear_table(table))
            .await
            .map_err(|e| ControlError::dataplane(table.name(), "clear", e))
    }

    pub async fn sync_counters(&self, table: TableId) -> Result<()> {
        self.call(table.name(), "sync", || self.client.sync_counters(table))
            .await
            .map_err(|e| ControlError::dataplane(table.name(), "sync", e))
    }

    pub async fn read_register(&self, table: TableId, start: u32, count: u32) -> Result<Vec<Vec<u64>>> {
        self.call(table.name(), "read", || self.client.read_register(table, start, count))
            .await
            .map_err(|e| ControlError::dataplane(table.name(), "read", e))
    }

    pub async fn write_register(&self, table: TableId, index: u32, values: &[u64]) -> Result<()> {
        self.call(table.name(), "write", || self.client.write_register(table, index, values))
            .await
            .map_err(|e| ControlError::dataplane(table.name(), "write", e))
    }

    pub async fn reset_register(&self, table: TableId) -> Result<()> {
        debug!("reset {}", table);
        self.call(table.name(), "reset", || self.client.reset_register(table))
            .await
            .map_err(|e| ControlError::dataplane(table.name(), "reset", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::memory::{Fault, MemoryDataplane, OpKind};
    use crate::dataplane::schema::{action, action::param, field};

    fn ops(dp: &Arc<MemoryDataplane>, retries: u32) -> TableOps {
        TableOps::new(dp.clone(), RetryConfig::immediate(retries), Duration::from_millis(50))
    }

    fn key() -> TableKey {
        TableKey::new().exact(field::ETH_DST, 0x0c42_a1dd_5990)
    }

    fn data(port: u64) -> ActionData {
        ActionData::new(action::SET_EGRESS_PORT).param(param::EGRESS_PORT, port)
    }

    #[tokio::test]
    async fn test_install_replaces_existing_entry() {
        let dp = Arc::new(MemoryDataplane::new());
        let ops = ops(&dp, 0);
        ops.install(TableId::Forward, &key(), &data(1)).await.unwrap();
        ops.install(TableId::Forward, &key(), &data(2)).await.unwrap();

        let entries = ops.entries(TableId::Forward).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data.get_int(param::EGRESS_PORT), Some(2));
    }

    #[tokio::test]
    async fn test_remove_absent_is_success() {
        let dp = Arc::new(MemoryDataplane::new());
        let ops = ops(&dp, 0);
        assert!(!ops.remove(TableId::Forward, &key()).await.unwrap());
        ops.install(TableId::Forward, &key(), &data(1)).await.unwrap();
        assert!(ops.remove(TableId::Forward, &key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dp = Arc::new(MemoryDataplane::new());
        dp.inject_fault(Some(TableId::Forward), Fault::Unavailable, 2).await;
        ops(&dp, 3).install(TableId::Forward, &key(), &data(1)).await.unwrap();
        assert_eq!(dp.entry_count(TableId::Forward).await, 1);
    }

    #[tokio::test]
    async fn test_persistent_failure_surfaces_as_unavailable() {
        let dp = Arc::new(MemoryDataplane::new());
        dp.inject_fault(Some(TableId::Forward), Fault::Unavailable, 10).await;
        let err = ops(&dp, 2).install(TableId::Forward, &key(), &data(1)).await.unwrap_err();
        assert_eq!(err.kind(), "DataplaneUnavailable");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_hung_call_times_out() {
        let dp = Arc::new(MemoryDataplane::new());
        dp.inject_fault(None, Fault::Hang(Duration::from_secs(5)), 1).await;
        let start = std::time::Instant::now();
        // The first attempt hangs past the deadline; the retry succeeds.
        ops(&dp, 1).reset_register(TableId::WorkerBitmap).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_hung_call_without_retry_reports_timeout() {
        let dp = Arc::new(MemoryDataplane::new());
        dp.inject_fault(None, Fault::Hang(Duration::from_secs(5)), 1).await;
        let err = ops(&dp, 0).reset_register(TableId::WorkerBitmap).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::DataplaneUnavailable {
                source: Some(DataplaneError::Timeout),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let dp = Arc::new(MemoryDataplane::new());
        let bad = ActionData::new(action::FLOOD);
        let err = ops(&dp, 3).install(TableId::Forward, &key(), &bad).await.unwrap_err();
        assert_eq!(err.kind(), "DataplaneRejected");
        let adds = dp.operations().await.iter().filter(|op| op.kind == OpKind::Add).count();
        assert_eq!(adds, 1);
    }

    #[tokio::test]
    async fn test_purge_selected_entries() {
        let dp = Arc::new(MemoryDataplane::new());
        let ops = ops(&dp, 0);
        for mac in 1..=4u64 {
            let key = TableKey::new().exact(field::ETH_DST, mac);
            ops.install(TableId::Forward, &key, &data(mac)).await.unwrap();
        }
        let removed = ops
            .purge(TableId::Forward, |e| e.data.get_int(param::EGRESS_PORT).unwrap_or(0) % 2 == 0)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(dp.entry_count(TableId::Forward).await, 2);
    }
}
