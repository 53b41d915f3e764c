// rust/switch-core/src/job/slots.rs

//! Aggregation slots and their per-set worker bitmaps.
//!
//! Each slot of the pool owns one cell of the worker-bitmap register. The
//! cell has two fields, one per set; workers alternate between the sets so
//! that one set can be replying while the other collects contributions.
//! The dataplane updates the bitmaps itself; the pool sizes the complete
//! mask, guarantees the register is zero at job boundaries, and offers the
//! same update primitive for diagnostics.

use tracing::{debug, error, info};

use super::registers::RegisterClearer;
use super::worker::MAX_WORKERS;
use crate::dataplane::{TableId, TableOps, REGISTER_SIZE};
use crate::error::{ControlError, Result};

/// Cells read per call when scanning the whole pool.
const SCAN_CHUNK: u32 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotSet {
    First,
    Second,
}

impl SlotSet {
    pub fn from_index(index: u32) -> Result<Self> {
        match index {
            0 => Ok(Self::First),
            1 => Ok(Self::Second),
            other => Err(ControlError::invalid_request(format!("slot set {} does not exist", other))),
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::First => 0,
            Self::Second => 1,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
        }
    }
}

/// Bitmaps of one slot as read back from the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBitmaps {
    pub pool_index: u32,
    pub sets: [u32; 2],
}

impl SlotBitmaps {
    pub fn get(&self, set: SlotSet) -> u32 {
        self.sets[set.index()]
    }

    /// Both sets hold contributions at once. Expected while workers move
    /// from one set to the other; once traffic has stopped it points at a
    /// missed clear or a worker out of step with the rest of the job.
    pub fn is_inconsistent(&self) -> bool {
        self.sets[0] != 0 && self.sets[1] != 0
    }
}

/// Outcome of applying one worker's contribution to a slot set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapUpdate {
    /// Bitmap of the set after the update.
    pub bitmap: u32,
    /// The set was empty before this contribution.
    pub first_contribution: bool,
    /// The worker's bit was already set; nothing was written.
    pub retransmission: bool,
    /// Every worker of the job has contributed to this set.
    pub complete: bool,
}

impl BitmapUpdate {
    /// A complete set lets the next epoch start on the other set.
    pub fn next_epoch_eligible(&self) -> bool {
        self.complete
    }
}

/// Mask with one bit per worker of a job of `num_workers`.
pub fn complete_mask_for(num_workers: u32) -> u32 {
    match num_workers {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => (1u32 << n) - 1,
    }
}

#[derive(Debug, Clone)]
pub struct SlotPool {
    pool_base: u32,
    pool_size: u32,
    complete_mask: u32,
    clearer: RegisterClearer,
}

impl SlotPool {
    pub fn new(pool_base: u32, pool_size: u32) -> Self {
        Self {
            pool_base,
            pool_size,
            complete_mask: 0,
            clearer: RegisterClearer::new([TableId::WorkerBitmap]),
        }
    }

    /// Sizes the pool for a job of `num_workers`.
    pub fn configure(&mut self, pool_size: u32, num_workers: u32) -> Result<()> {
        if num_workers > MAX_WORKERS {
            return Err(ControlError::capacity_exceeded(num_workers, MAX_WORKERS));
        }
        if pool_size == 0 || u64::from(self.pool_base) + u64::from(pool_size) > u64::from(REGISTER_SIZE) {
            return Err(ControlError::invalid_request(format!(
                "pool of {} slots at base {} does not fit the register space of {}",
                pool_size, self.pool_base, REGISTER_SIZE
            )));
        }
        self.pool_size = pool_size;
        self.complete_mask = complete_mask_for(num_workers);
        info!(
            "Slot pool sized for {} workers ({} slots, complete mask {:#x})",
            num_workers, pool_size, self.complete_mask
        );
        Ok(())
    }

    pub fn pool_base(&self) -> u32 {
        self.pool_base
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    pub fn complete_mask(&self) -> u32 {
        self.complete_mask
    }

    /// Zeroes both sets of every slot and checks the pool reads back as zero.
    pub async fn clear_all_bitmaps(&self, ops: &TableOps) -> Result<()> {
        self.clearer.clear(ops).await?;
        self.clearer.verify(ops, self.pool_base, self.pool_size).await?;
        debug!("Cleared bitmaps of {} slots", self.pool_size);
        Ok(())
    }

    fn check_range(&self, start: u32, count: u32) -> Result<()> {
        if u64::from(start) + u64::from(count) > u64::from(self.pool_size) {
            return Err(ControlError::invalid_request(format!(
                "slots {}..{} are outside the pool of {}",
                start,
                u64::from(start) + u64::from(count),
                self.pool_size
            )));
        }
        Ok(())
    }

    /// Reads the bitmaps of `count` slots starting at pool index `start`.
    pub async fn read_bitmaps(&self, ops: &TableOps, start: u32, count: u32) -> Result<Vec<SlotBitmaps>> {
        self.check_range(start, count)?;
        let cells = ops
            .read_register(TableId::WorkerBitmap, self.pool_base + start, count)
            .await?;
        Ok(cells
            .into_iter()
            .zip(start..)
            .map(|(cell, pool_index)| SlotBitmaps {
                pool_index,
                sets: [
                    cell.first().copied().unwrap_or(0) as u32,
                    cell.get(1).copied().unwrap_or(0) as u32,
                ],
            })
            .collect())
    }

    /// Slots whose two sets are both non-zero.
    pub async fn inconsistent_bitmaps(&self, ops: &TableOps) -> Result<Vec<SlotBitmaps>> {
        let mut found = Vec::new();
        let mut start = 0;
        while start < self.pool_size {
            let count = SCAN_CHUNK.min(self.pool_size - start);
            found.extend(
                self.read_bitmaps(ops, start, count)
                    .await?
                    .into_iter()
                    .filter(SlotBitmaps::is_inconsistent),
            );
            start += count;
        }
        Ok(found)
    }

    /// Applies a contribution the way the dataplane does: the worker's bit is
    /// ORed into `set` and cleared from the other set. A bit that is already
    /// present is a retransmission and changes nothing.
    pub async fn record_contribution(
        &self,
        ops: &TableOps,
        pool_index: u32,
        set: SlotSet,
        bit_mask: u32,
    ) -> Result<BitmapUpdate> {
        if self.complete_mask == 0 {
            let message = format!(
                "contribution to slot {} while the pool is configured for zero workers",
                pool_index
            );
            error!("{}", message);
            return Err(ControlError::stale_state(message));
        }
        if bit_mask == 0 || bit_mask & !self.complete_mask != 0 {
            let message = format!(
                "contribution {:#x} to slot {} is outside the complete mask {:#x}",
                bit_mask, pool_index, self.complete_mask
            );
            error!("{}", message);
            return Err(ControlError::stale_state(message));
        }
        self.check_range(pool_index, 1)?;

        let index = self.pool_base + pool_index;
        let cell = ops.read_register(TableId::WorkerBitmap, index, 1).await?;
        let mut sets = [0u32; 2];
        if let Some(values) = cell.first() {
            for (dst, src) in sets.iter_mut().zip(values) {
                *dst = *src as u32;
            }
        }

        let current = sets[set.index()];
        if current & bit_mask != 0 {
            return Ok(BitmapUpdate {
                bitmap: current,
                first_contribution: false,
                retransmission: true,
                complete: current == self.complete_mask,
            });
        }

        sets[set.index()] = current | bit_mask;
        sets[set.other().index()] &= !bit_mask;
        ops.write_register(TableId::WorkerBitmap, index, &[u64::from(sets[0]), u64::from(sets[1])])
            .await?;

        let bitmap = sets[set.index()];
        Ok(BitmapUpdate {
            bitmap,
            first_contribution: current == 0,
            retransmission: false,
            complete: bitmap == self.complete_mask,
        })
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

    #[test]
    fn test_complete_mask() {
        assert_eq!(complete_mask_for(0), 0);
        assert_eq!(complete_mask_for(1), 1);
        assert_eq!(complete_mask_for(3), 0b111);
        assert_eq!(complete_mask_for(32), u32::MAX);
    }

    #[test]
    fn test_configure() {
        let mut pool = SlotPool::new(0, REGISTER_SIZE);
        pool.configure(REGISTER_SIZE, 4).unwrap();
        assert_eq!(pool.complete_mask(), 0xf);
        pool.configure(REGISTER_SIZE, 2).unwrap();
        assert_eq!(pool.complete_mask(), 0b11);

        assert_eq!(pool.configure(REGISTER_SIZE, 33).unwrap_err().kind(), "CapacityExceeded");
        assert_eq!(pool.complete_mask(), 0b11);
        assert!(pool.configure(REGISTER_SIZE + 1, 2).is_err());
        assert!(pool.configure(0, 2).is_err());
    }

    #[tokio::test]
    async fn test_contributions_complete_a_set() {
        let (_dp, ops) = setup();
        let mut pool = SlotPool::new(0, 64);
        pool.configure(64, 3).unwrap();

        let update = pool.record_contribution(&ops, 5, SlotSet::First, 0b001).await.unwrap();
        assert!(update.first_contribution);
        assert!(!update.complete);

        let update = pool.record_contribution(&ops, 5, SlotSet::First, 0b010).await.unwrap();
        assert!(!update.first_contribution);
        assert_eq!(update.bitmap, 0b011);

        let retransmit = pool.record_contribution(&ops, 5, SlotSet::First, 0b010).await.unwrap();
        assert!(retransmit.retransmission);
        assert_eq!(retransmit.bitmap, 0b011);

        let update = pool.record_contribution(&ops, 5, SlotSet::First, 0b100).await.unwrap();
        assert!(update.complete);
        assert!(update.next_epoch_eligible());
        assert_eq!(update.bitmap, pool.complete_mask());
    }

    #[tokio::test]
    async fn test_contribution_moves_bit_between_sets() {
        let (_dp, ops) = setup();
        let mut pool = SlotPool::new(100, 64);
        pool.configure(64, 2).unwrap();

        pool.record_contribution(&ops, 1, SlotSet::First, 0b01).await.unwrap();
        pool.record_contribution(&ops, 1, SlotSet::First, 0b10).await.unwrap();
        let next = pool.record_contribution(&ops, 1, SlotSet::Second, 0b01).await.unwrap();
        assert!(next.first_contribution);

        let bitmaps = pool.read_bitmaps(&ops, 1, 1).await.unwrap();
        assert_eq!(bitmaps[0].sets, [0b10, 0b01]);
        assert!(bitmaps[0].is_inconsistent());
        assert_eq!(pool.inconsistent_bitmaps(&ops).await.unwrap(), bitmaps);
    }

    #[tokio::test]
    async fn test_zero_workers_is_stale_state() {
        let (_dp, ops) = setup();
        let pool = SlotPool::new(0, 64);
        let err = pool.record_contribution(&ops, 0, SlotSet::First, 1).await.unwrap_err();
        assert_eq!(err.kind(), "StaleStateDetected");
    }

    #[tokio::test]
    async fn test_foreign_bit_is_stale_state() {
        let (_dp, ops) = setup();
        let mut pool = SlotPool::new(0, 64);
        pool.configure(64, 1).unwrap();
        let err = pool.record_contribution(&ops, 0, SlotSet::First, 0b10).await.unwrap_err();
        assert_eq!(err.kind(), "StaleStateDetected");
    }

    #[tokio::test]
    async fn test_clear_all_bitmaps() {
        let (dp, ops) = setup();
        let pool = SlotPool::new(0, REGISTER_SIZE);
        dp.write_register(TableId::WorkerBitmap, 17, &[0b11, 0b01]).await.unwrap();
        dp.write_register(TableId::WorkerBitmap, 22527, &[0, 0b01]).await.unwrap();

        pool.clear_all_bitmaps(&ops).await.unwrap();
        assert!(pool.inconsistent_bitmaps(&ops).await.unwrap().is_empty());
        let bitmaps = pool.read_bitmaps(&ops, 22527, 1).await.unwrap();
        assert_eq!(bitmaps[0].sets, [0, 0]);
    }

    #[tokio::test]
    async fn test_read_outside_pool() {
        let (_dp, ops) = setup();
        let pool = SlotPool::new(0, 16);
        assert_eq!(pool.read_bitmaps(&ops, 10, 7).await.unwrap_err().kind(), "InvalidRequest");
        assert!(SlotSet::from_index(2).is_err());
        assert_eq!(SlotSet::from_index(1).unwrap().other(), SlotSet::First);
    }
}
