// rust/switch-core/src/job/registry.rs

use tracing::debug;

use super::worker::{Worker, WorkerAddress, WorkerRole, MAX_WORKERS};
use crate::error::{ControlError, Result};

/// Admitted workers of the current job, in admission order.
///
/// Pure bookkeeping: the registry never touches the dataplane, so its state
/// can be checked independently of what is programmed into the switch.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Vec<Worker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a worker, rejecting it before any state change if the job is
    /// too large, the registry is full, or the rank is taken.
    pub fn admit(&mut self, rank: u32, job_size: u32, address: WorkerAddress, role: WorkerRole) -> Result<Worker> {
        if job_size > MAX_WORKERS {
            return Err(ControlError::capacity_exceeded(job_size, MAX_WORKERS));
        }
        if self.workers.len() as u32 >= MAX_WORKERS {
            return Err(ControlError::capacity_exceeded(self.workers.len() as u32 + 1, MAX_WORKERS));
        }
        if rank >= MAX_WORKERS {
            return Err(ControlError::invalid_request(format!(
                "rank {} is outside the {}-bit worker bitmap",
                rank, MAX_WORKERS
            )));
        }
        if role == WorkerRole::Aggregator && rank >= job_size {
            return Err(ControlError::invalid_request(format!(
                "rank {} is not below job size {}",
                rank, job_size
            )));
        }
        if self.get(rank).is_some() {
            return Err(ControlError::duplicate_rank(rank));
        }
        address.validate()?;

        let worker = Worker::new(rank, role, address);
        debug!("Registered {} rank {} (rid {})", worker.role, rank, worker.rid);
        self.workers.push(worker.clone());
        Ok(worker)
    }

    pub fn remove(&mut self, rank: u32) -> Result<Worker> {
        let index = self
            .workers
            .iter()
            .position(|w| w.rank == rank)
            .ok_or_else(|| ControlError::not_found(format!("rank {}", rank)))?;
        Ok(self.workers.remove(index))
    }

    /// Removes every worker, returning them in admission order.
    pub fn clear_all(&mut self) -> Vec<Worker> {
        std::mem::take(&mut self.workers)
    }

    pub fn list(&self) -> &[Worker] {
        &self.workers
    }

    pub fn get(&self, rank: u32) -> Option<&Worker> {
        self.workers.iter().find(|w| w.rank == rank)
    }

    pub fn aggregators(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter().filter(|w| w.is_aggregator())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::worker::MacAddr;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    fn udp(n: u64) -> WorkerAddress {
        WorkerAddress::Udp {
            mac: MacAddr::from_u64(0x0200_0000_0000 + n),
            ipv4: Ipv4Addr::new(10, 0, 0, n as u8),
        }
    }

    #[test]
    fn test_admit_and_list_in_order() {
        let mut registry = WorkerRegistry::new();
        for rank in [2, 0, 1] {
            registry.admit(rank, 3, udp(rank.into()), WorkerRole::Aggregator).unwrap();
        }
        let ranks: Vec<u32> = registry.list().iter().map(|w| w.rank).collect();
        assert_eq!(ranks, vec![2, 0, 1]);
    }

    #[test]
    fn test_capacity_invariant() {
        let mut registry = WorkerRegistry::new();
        for rank in 0..MAX_WORKERS {
            registry.admit(rank, 32, udp(rank.into()), WorkerRole::Aggregator).unwrap();
        }
        let before: Vec<Worker> = registry.list().to_vec();

        let err = registry
            .admit(0, 32, udp(99), WorkerRole::Endpoint)
            .unwrap_err();
        assert_eq!(err.kind(), "CapacityExceeded");
        assert_eq!(registry.list(), before.as_slice());
    }

    #[test]
    fn test_job_size_above_capacity() {
        let mut registry = WorkerRegistry::new();
        let err = registry.admit(0, 33, udp(0), WorkerRole::Aggregator).unwrap_err();
        assert!(matches!(err, ControlError::CapacityExceeded { requested: 33, max: 32 }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_rank() {
        let mut registry = WorkerRegistry::new();
        registry.admit(1, 2, udp(1), WorkerRole::Aggregator).unwrap();
        let err = registry.admit(1, 2, udp(2), WorkerRole::Aggregator).unwrap_err();
        assert_eq!(err.kind(), "DuplicateRank");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rank_outside_job() {
        let mut registry = WorkerRegistry::new();
        let err = registry.admit(4, 4, udp(4), WorkerRole::Aggregator).unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");

        // Endpoints may use ranks past the job size.
        registry.admit(4, 4, udp(4), WorkerRole::Endpoint).unwrap();
        assert!(registry.admit(32, 4, udp(5), WorkerRole::Endpoint).is_err());
    }

    #[test]
    fn test_bit_masks_are_distinct() {
        let mut registry = WorkerRegistry::new();
        for rank in 0..8 {
            registry.admit(rank, 8, udp(rank.into()), WorkerRole::Aggregator).unwrap();
        }
        let masks: HashSet<u32> = registry.list().iter().map(|w| w.bit_mask).collect();
        assert_eq!(masks.len(), 8);
        assert!(registry.list().iter().all(|w| w.bit_mask == 1 << w.rank));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut registry = WorkerRegistry::new();
        registry.admit(0, 2, udp(0), WorkerRole::Aggregator).unwrap();
        registry.admit(1, 2, udp(1), WorkerRole::Aggregator).unwrap();

        assert_eq!(registry.remove(0).unwrap().rank, 0);
        assert_eq!(registry.remove(0).unwrap_err().kind(), "NotFound");

        let cleared = registry.clear_all();
        assert_eq!(cleared.len(), 1);
        assert!(registry.is_empty());
        assert!(registry.clear_all().is_empty());
    }
}
