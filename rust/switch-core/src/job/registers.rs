// rust/switch-core/src/job/registers.rs

use tracing::{debug, error};

use crate::dataplane::{TableId, TableOps};
use crate::error::{ControlError, Result};

/// Cells read per call when verifying a register.
const VERIFY_CHUNK: u32 = 2048;

/// Resets a fixed set of registers and indexed counters to zero.
#[derive(Debug, Clone)]
pub struct RegisterClearer {
    tables: Vec<TableId>,
}

impl RegisterClearer {
    pub fn new(tables: impl IntoIterator<Item = TableId>) -> Self {
        Self {
            tables: tables.into_iter().collect(),
        }
    }

    pub async fn clear(&self, ops: &TableOps) -> Result<()> {
        for table in &self.tables {
            ops.reset_register(*table).await?;
        }
        debug!("Cleared {} registers", self.tables.len());
        Ok(())
    }

    /// Reads back `count` cells starting at `start` from every register and
    /// fails if any of them is non-zero.
    pub async fn verify(&self, ops: &TableOps, start: u32, count: u32) -> Result<()> {
        for table in &self.tables {
            let end = start + count.min(table.schema().size.saturating_sub(start));
            let mut index = start;
            while index < end {
                let chunk = VERIFY_CHUNK.min(end - index);
                let cells = ops.read_register(*table, index, chunk).await?;
                if let Some(offset) = cells.iter().position(|cell| cell.iter().any(|v| *v != 0)) {
                    let message = format!("{} cell {} is {:?} after clear", table, index + offset as u32, cells[offset]);
                    error!("{}", message);
                    return Err(ControlError::stale_state(message));
                }
                index += chunk;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::{MemoryDataplane, TableClient};
    use crate::retry::RetryConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryDataplane>, TableOps) {
        let dp = Arc::new(MemoryDataplane::new());
        let ops = TableOps::new(dp.clone(), RetryConfig::no_retry(), Duration::from_secs(1));
        (dp, ops)
    }

    #[tokio::test]
    async fn test_clear_resets_every_table() {
        let (dp, ops) = setup();
        dp.write_register(TableId::WorkerBitmap, 10, &[1, 2]).await.unwrap();
        dp.write_register(TableId::ExponentMax, 3, &[7, 0]).await.unwrap();
        dp.write_register(TableId::DropCounter, 9, &[5]).await.unwrap();

        let clearer = RegisterClearer::new(TableId::SLOT_REGISTERS.into_iter().chain(TableId::COUNTERS));
        clearer.clear(&ops).await.unwrap();
        clearer.verify(&ops, 0, 64).await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_reports_stale_cells() {
        let (dp, ops) = setup();
        dp.write_register(TableId::WorkerBitmap, 4000, &[0, 0b10]).await.unwrap();

        let clearer = RegisterClearer::new([TableId::WorkerBitmap]);
        let err = clearer.verify(&ops, 0, 22528).await.unwrap_err();
        assert_eq!(err.kind(), "StaleStateDetected");
        assert!(err.to_string().contains("cell 4000"));

        // Cells outside the verified range are not inspected.
        clearer.verify(&ops, 0, 4000).await.unwrap();
    }

    #[tokio::test]
    async fn test_only_listed_tables_are_cleared() {
        let (dp, ops) = setup();
        dp.write_register(TableId::WorkerCount, 1, &[3]).await.unwrap();
        RegisterClearer::new([TableId::WorkerBitmap]).clear(&ops).await.unwrap();
        let cells = dp.read_register(TableId::WorkerCount, 1, 1).await.unwrap();
        assert_eq!(cells, vec![vec![3]]);
    }
}
