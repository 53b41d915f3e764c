// rust/switch-core/src/job/coordinator.rs

//! Job lifecycle coordination.
//!
//! [`JobCoordinator`] owns the worker registry, the slot pool and the
//! multicast groups, and is the only component that programs worker state
//! into the switch. All mutations are serialized behind one write lock and
//! run on their own task, so a client that gives up on a request cannot
//! leave the switch half programmed.
//!
//! Phases:
//!
//! ```text
//! Unconfigured --configure--> Configuring --ok--> Ready
//! Ready --clear_all_workers--> Draining --ok--> Ready
//! ```
//!
//! A failed configure stays in `Configuring` and a failed clear stays in
//! `Draining`; both are left by retrying the same operation.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::description::JobDescription;
use super::entries::{self, AdmissionParams};
use super::multicast::{MulticastGroupManager, MulticastNode};
use super::ports::PortMap;
use super::registers::RegisterClearer;
use super::registry::WorkerRegistry;
use super::slots::{BitmapUpdate, SlotBitmaps, SlotPool, SlotSet};
use super::worker::{flood_rid, MacAddr, QueuePair, Worker, WorkerAddress, WorkerRole, MAX_WORKERS};
use crate::config::JobConfiguration;
use crate::dataplane::schema::QUEUE_PAIRS_PER_WORKER;
use crate::dataplane::{Schema, TableId, TableOps};
use crate::error::{ControlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unconfigured,
    Configuring,
    Ready,
    Draining,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Unconfigured => "unconfigured",
            Phase::Configuring => "configuring",
            Phase::Ready => "ready",
            Phase::Draining => "draining",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A worker asking to join the current job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmitRequest {
    pub rank: u32,
    pub job_size: u32,
    pub role: WorkerRole,
    pub address: WorkerAddress,
}

/// What a worker needs to start sending to the switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub worker: Worker,
    pub dev_port: u16,
    /// Incremented every time the switch is cleared for a new job.
    pub job_id: u64,
    pub switch_mac: MacAddr,
    pub switch_ipv4: Ipv4Addr,
    pub udp_port: u16,
    pub udp_port_mask: u16,
    pub pool_base: u32,
    pub pool_size: u32,
    pub complete_mask: u32,
    /// The worker's own rkey, echoed back for RoCE workers.
    pub rkey: Option<u32>,
    pub switch_queue_pairs: Vec<QueuePair>,
    pub cleared_previous_job: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub phase: Phase,
    pub job_id: u64,
    pub job_size: Option<u32>,
    pub workers: usize,
    pub aggregators: usize,
    pub pool_base: u32,
    pub pool_size: u32,
    pub complete_mask: u32,
    pub aggregation_members: Vec<MulticastNode>,
    pub all_ports_members: Vec<MulticastNode>,
    pub last_cleared_at: Option<DateTime<Utc>>,
}

/// Packet counts of a worker's admission entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCounters {
    pub rank: u32,
    pub packets: u64,
    pub bytes: u64,
}

/// RDMA receiver counters of one queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePairCounters {
    pub rank: u32,
    pub queue_pair: u32,
    pub packets: u64,
    pub messages: u64,
    pub sequence_violations: u64,
    pub simulated_drops: u64,
}

/// Next-step counters of one slot set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCounters {
    pub index: u32,
    pub pool_index: u32,
    pub set: SlotSet,
    pub recirculated: u64,
    pub broadcast: u64,
    pub retransmitted: u64,
    pub dropped: u64,
}

const QUEUE_PAIR_COUNTERS: [TableId; 4] = [
    TableId::RdmaPacketCounter,
    TableId::RdmaMessageCounter,
    TableId::RdmaSequenceViolationCounter,
    TableId::SimulatedDropCounter,
];

const SLOT_COUNTERS: [TableId; 4] = [
    TableId::RecirculateCounter,
    TableId::BroadcastCounter,
    TableId::RetransmitCounter,
    TableId::DropCounter,
];

/// Reads the same range from each counter, one column per counter.
async fn read_counter_columns(ops: &TableOps, tables: [TableId; 4], start: u32, count: u32) -> Result<[Vec<u64>; 4]> {
    let mut columns: [Vec<u64>; 4] = Default::default();
    for (column, table) in columns.iter_mut().zip(tables) {
        *column = ops
            .read_register(table, start, count)
            .await?
            .into_iter()
            .map(|cell| cell.first().copied().unwrap_or(0))
            .collect();
    }
    Ok(columns)
}

#[derive(Debug)]
struct State {
    phase: Phase,
    config: JobConfiguration,
    ports: PortMap,
    registry: WorkerRegistry,
    slots: SlotPool,
    multicast: MulticastGroupManager,
    job_size: Option<u32>,
    job_id: u64,
    /// Nothing has been admitted since the last clear.
    fresh: bool,
    last_cleared_at: Option<DateTime<Utc>>,
}

impl State {
    fn require(&self, operation: &'static str, allowed: &[Phase]) -> Result<()> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }
        let required = match allowed {
            [Phase::Ready] => "ready",
            _ => "ready or draining",
        };
        Err(ControlError::NotReady {
            operation,
            phase: self.phase.name(),
            required,
        })
    }

    fn admission_params(&self) -> AdmissionParams {
        AdmissionParams {
            job_size: self.job_size.unwrap_or(0),
            complete_mask: self.slots.complete_mask(),
            pool_base: self.slots.pool_base(),
            pool_size: self.slots.pool_size(),
        }
    }

    /// Rejects a request before anything is cleared or programmed. Returns
    /// the worker's device port.
    ///
    /// When the request starts a new job the current workers are about to be
    /// cleared, so neither the registry size nor the current job size apply.
    fn check_admission(
        &self,
        rank: u32,
        job_size: u32,
        role: WorkerRole,
        address: &WorkerAddress,
        starts_new_job: bool,
    ) -> Result<u16> {
        let admitted = if starts_new_job { 0 } else { self.registry.len() as u32 };
        if admitted >= MAX_WORKERS || (role == WorkerRole::Aggregator && job_size > MAX_WORKERS) {
            return Err(ControlError::capacity_exceeded(job_size.max(admitted + 1), MAX_WORKERS));
        }
        if rank >= MAX_WORKERS {
            return Err(ControlError::invalid_request(format!(
                "rank {} is outside the {}-bit worker bitmap",
                rank, MAX_WORKERS
            )));
        }
        if role == WorkerRole::Aggregator {
            if job_size == 0 {
                return Err(ControlError::invalid_request("job_size must be at least 1"));
            }
            if rank >= job_size {
                return Err(ControlError::invalid_request(format!(
                    "rank {} is not below job size {}",
                    rank, job_size
                )));
            }
            if let Some(current) = self.job_size {
                if !starts_new_job && current != job_size && self.registry.aggregators().next().is_some() {
                    return Err(ControlError::invalid_request(format!(
                        "rank {} reports job size {} but the current job has {} workers",
                        rank, job_size, current
                    )));
                }
            }
        }
        address.validate()?;
        self.ports.dev_port(address.mac())
    }

    /// Device port of a registered worker, preferring the multicast index
    /// over the port map so removal still works after the port map changed.
    fn worker_dev_port(&self, worker: &Worker) -> Result<u16> {
        let indexed = if worker.is_aggregator() {
            self.multicast.dev_port(self.config.aggregation_group_id, worker.rid)
        } else {
            None
        };
        match indexed {
            Some(dev_port) => Ok(dev_port),
            None => self.ports.dev_port(worker.address.mac()),
        }
    }

    fn dev_port_shared(&self, worker: &Worker, dev_port: u16) -> bool {
        self.registry
            .list()
            .iter()
            .filter(|other| other.rank != worker.rank)
            .any(|other| self.worker_dev_port(other).ok() == Some(dev_port))
    }
}

#[derive(Debug)]
struct Inner {
    ops: TableOps,
    state: RwLock<State>,
}

/// Owns the lifecycle of workers, slots and multicast groups for one switch.
#[derive(Debug, Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
}

impl JobCoordinator {
    pub fn new(ops: TableOps, config: JobConfiguration) -> Result<Self> {
        let ports = PortMap::new(&config.ports)?;
        let slots = SlotPool::new(config.pool_base, config.pool_size);
        let state = State {
            phase: Phase::Unconfigured,
            config,
            ports,
            registry: WorkerRegistry::new(),
            slots,
            multicast: MulticastGroupManager::new(),
            job_size: None,
            job_id: 0,
            fresh: true,
            last_cleared_at: None,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                ops,
                state: RwLock::new(state),
            }),
        })
    }

    /// Runs a mutation on its own task so it completes even if the caller
    /// is cancelled.
    async fn run_detached<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Inner>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(f(self.inner.clone()))
            .await
            .map_err(|e| ControlError::internal(format!("{} task failed: {}", operation, e)))?
    }

    /// Brings the switch to a known empty state for the current
    /// configuration. Safe to call again after a failure.
    pub async fn configure(&self) -> Result<()> {
        self.run_detached("configure", |inner| async move {
            let mut state = inner.state.write().await;
            inner.configure_locked(&mut state).await?;
            Ok(())
        })
        .await
    }

    /// Replaces the job configuration, clearing the previous job first.
    pub async fn reconfigure(&self, config: JobConfiguration) -> Result<()> {
        let ports = PortMap::new(&config.ports)?;
        self.run_detached("reconfigure", move |inner| async move {
            let mut state = inner.state.write().await;
            if matches!(state.phase, Phase::Ready | Phase::Draining) {
                inner.clear_locked(&mut state).await?;
            }
            info!(
                "Reconfiguring: {} ports, pool {}+{}",
                ports.len(),
                config.pool_base,
                config.pool_size
            );
            state.slots = SlotPool::new(config.pool_base, config.pool_size);
            state.ports = ports;
            state.config = config;
            inner.configure_locked(&mut state).await?;
            Ok(())
        })
        .await
    }

    pub async fn admit_worker(&self, request: AdmitRequest) -> Result<Admission> {
        self.run_detached("admit_worker", move |inner| async move {
            let mut state = inner.state.write().await;
            let admission = inner.admit_locked(&mut state, request).await?;
            Ok(admission)
        })
        .await
    }

    pub async fn remove_worker(&self, rank: u32) -> Result<Worker> {
        self.run_detached("remove_worker", move |inner| async move {
            let mut state = inner.state.write().await;
            let worker = inner.remove_locked(&mut state, rank).await?;
            Ok(worker)
        })
        .await
    }

    /// Returns the switch to the empty-job state. Returns the number of
    /// workers that were removed.
    pub async fn clear_all_workers(&self) -> Result<usize> {
        self.run_detached("clear_all_workers", |inner| async move {
            let mut state = inner.state.write().await;
            state.require("clear_all_workers", &[Phase::Ready, Phase::Draining])?;
            let removed = inner.clear_locked(&mut state).await?;
            Ok(removed)
        })
        .await
    }

    /// Clears the switch and admits every worker of a job description in
    /// rank order.
    pub async fn load_job(&self, description: JobDescription) -> Result<Vec<Admission>> {
        self.run_detached("load_job", move |inner| async move {
            let mut state = inner.state.write().await;
            state.require("load_job", &[Phase::Ready, Phase::Draining])?;
            let plan = description.plan(&state.ports)?;
            inner.clear_locked(&mut state).await?;

            let mut admissions = Vec::with_capacity(plan.len());
            for planned in plan {
                let request = AdmitRequest {
                    rank: planned.rank,
                    job_size: planned.job_size,
                    role: planned.role,
                    address: planned.address,
                };
                admissions.push(inner.admit_locked(&mut state, request).await?);
            }
            info!("Loaded job {} with {} workers", state.job_id, admissions.len());
            Ok(admissions)
        })
        .await
    }

    /// Records a contribution from `rank` in the slot bitmap, the way the
    /// dataplane would on receipt of its packet.
    pub async fn simulate_contribution(&self, pool_index: u32, set: SlotSet, rank: u32) -> Result<BitmapUpdate> {
        self.run_detached("simulate_contribution", move |inner| async move {
            let state = inner.state.write().await;
            state.require("simulate_contribution", &[Phase::Ready])?;
            let worker = state
                .registry
                .get(rank)
                .filter(|w| w.is_aggregator())
                .ok_or_else(|| ControlError::not_found(format!("aggregating worker with rank {}", rank)))?;
            let update = state
                .slots
                .record_contribution(&inner.ops, pool_index, set, worker.bit_mask)
                .await?;
            Ok(update)
        })
        .await
    }

    pub async fn phase(&self) -> Phase {
        self.inner.state.read().await.phase
    }

    pub async fn list_workers(&self) -> Vec<Worker> {
        self.inner.state.read().await.registry.list().to_vec()
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let state = self.inner.state.read().await;
        CoordinatorStatus {
            phase: state.phase,
            job_id: state.job_id,
            job_size: state.job_size,
            workers: state.registry.len(),
            aggregators: state.registry.aggregators().count(),
            pool_base: state.slots.pool_base(),
            pool_size: state.slots.pool_size(),
            complete_mask: state.slots.complete_mask(),
            aggregation_members: state.multicast.members(state.config.aggregation_group_id),
            all_ports_members: state.multicast.members(state.config.all_ports_group_id),
            last_cleared_at: state.last_cleared_at,
        }
    }

    /// Slot bitmaps for `count` slots starting at `start`, relative to the pool.
    pub async fn read_bitmaps(&self, start: u32, count: u32) -> Result<Vec<SlotBitmaps>> {
        let state = self.inner.state.read().await;
        state.slots.read_bitmaps(&self.inner.ops, start, count).await
    }

    /// Slots whose two bitmap sets disagree about who has contributed.
    pub async fn inconsistent_bitmaps(&self) -> Result<Vec<SlotBitmaps>> {
        let state = self.inner.state.read().await;
        state.slots.inconsistent_bitmaps(&self.inner.ops).await
    }

    /// Packets matched by each worker's admission entries since they were
    /// installed.
    pub async fn worker_counters(&self) -> Result<Vec<WorkerCounters>> {
        let state = self.inner.state.read().await;
        let ops = &self.inner.ops;

        let mut totals: BTreeMap<u32, WorkerCounters> = state
            .registry
            .aggregators()
            .map(|w| {
                (
                    w.rank,
                    WorkerCounters {
                        rank: w.rank,
                        packets: 0,
                        bytes: 0,
                    },
                )
            })
            .collect();

        for table in [TableId::GetWorkerBitmap, TableId::RdmaReceiver] {
            ops.sync_counters(table).await?;
            for entry in ops.entries(table).await? {
                let Some(rank) = entries::admission_rank(table, &entry) else {
                    continue;
                };
                if let Some(total) = totals.get_mut(&rank) {
                    total.packets += entry.packets;
                    total.bytes += entry.bytes;
                }
            }
        }
        Ok(totals.into_values().collect())
    }

    /// RDMA receiver counters of queue pairs `start..start + count` of one
    /// aggregating worker.
    pub async fn queue_pair_counters(&self, rank: u32, start: u32, count: u32) -> Result<Vec<QueuePairCounters>> {
        if u64::from(start) + u64::from(count) > u64::from(QUEUE_PAIRS_PER_WORKER) {
            return Err(ControlError::invalid_request(format!(
                "queue pairs {}..{} are outside the {} tracked per worker",
                start,
                u64::from(start) + u64::from(count),
                QUEUE_PAIRS_PER_WORKER
            )));
        }
        let state = self.inner.state.read().await;
        let worker = state
            .registry
            .get(rank)
            .filter(|w| w.is_aggregator())
            .ok_or_else(|| ControlError::not_found(format!("aggregating worker with rank {}", rank)))?;
        let base = u32::from(worker.rid) * QUEUE_PAIRS_PER_WORKER + start;

        let [packets, messages, violations, drops] =
            read_counter_columns(&self.inner.ops, QUEUE_PAIR_COUNTERS, base, count).await?;
        Ok((0..count as usize)
            .map(|i| QueuePairCounters {
                rank,
                queue_pair: start + i as u32,
                packets: packets[i],
                messages: messages[i],
                sequence_violations: violations[i],
                simulated_drops: drops[i],
            })
            .collect())
    }

    /// Next-step counters of counter indices `start..start + count`. Each
    /// slot owns two consecutive indices, one per set.
    pub async fn slot_counters(&self, start: u32, count: u32) -> Result<Vec<SlotCounters>> {
        let size = TableId::RecirculateCounter.schema().size;
        if u64::from(start) + u64::from(count) > u64::from(size) {
            return Err(ControlError::invalid_request(format!(
                "counters {}..{} are outside the {} slot counters",
                start,
                u64::from(start) + u64::from(count),
                size
            )));
        }
        let _state = self.inner.state.read().await;
        let [recirculated, broadcast, retransmitted, dropped] =
            read_counter_columns(&self.inner.ops, SLOT_COUNTERS, start, count).await?;
        (0..count as usize)
            .map(|i| {
                let index = start + i as u32;
                Ok(SlotCounters {
                    index,
                    pool_index: index >> 1,
                    set: SlotSet::from_index(index & 1)?,
                    recirculated: recirculated[i],
                    broadcast: broadcast[i],
                    retransmitted: retransmitted[i],
                    dropped: dropped[i],
                })
            })
            .collect()
    }

    /// Zeroes every indexed counter. Workers, bitmaps and multicast groups
    /// are left alone.
    pub async fn clear_counters(&self) -> Result<()> {
        self.run_detached("clear_counters", |inner| async move {
            let state = inner.state.write().await;
            state.require("clear_counters", &[Phase::Ready, Phase::Draining])?;
            RegisterClearer::new(TableId::COUNTERS).clear(&inner.ops).await?;
            info!("Cleared counters of job {}", state.job_id);
            Ok(())
        })
        .await
    }
}

impl Inner {
    async fn configure_locked(&self, state: &mut State) -> Result<()> {
        state.phase = Phase::Configuring;
        info!("Configuring switch for job aggregation");

        Schema::validate()?;
        let exposed = self.ops.table_names().await?;
        Schema::check_exposed(&exposed)?;

        let mut multicast = MulticastGroupManager::new();
        multicast
            .ensure_group(&self.ops, state.config.aggregation_group_id)
            .await?;
        multicast
            .ensure_group(&self.ops, state.config.all_ports_group_id)
            .await?;
        state.multicast = multicast;

        self.ops.clear_table(TableId::Forward).await?;
        for entry in entries::forwarding_entries(&state.ports, state.config.all_ports_group_id) {
            self.ops.install(entry.table, &entry.key, &entry.data).await?;
        }
        for entry in entries::default_entries() {
            self.ops.install(entry.table, &entry.key, &entry.data).await?;
        }

        self.purge_worker_entries().await?;
        state.slots.configure(state.slots.pool_size(), 0)?;
        self.clear_registers(&state.slots).await?;

        state.registry.clear_all();
        state.job_size = None;
        state.job_id += 1;
        state.fresh = true;
        state.last_cleared_at = Some(Utc::now());
        state.phase = Phase::Ready;
        info!(
            "Switch ready: job {}, {} ports, pool {}+{}",
            state.job_id,
            state.ports.len(),
            state.slots.pool_base(),
            state.slots.pool_size()
        );
        Ok(())
    }

    async fn purge_worker_entries(&self) -> Result<usize> {
        let mut purged = 0;
        for table in TableId::PER_WORKER {
            purged += self
                .ops
                .purge(table, |entry| !entries::is_default_entry(table, entry))
                .await?;
        }
        debug!("Purged {} worker entries", purged);
        Ok(purged)
    }

    /// Zeroes every slot register and counter, then checks the pool bitmaps
    /// actually read back as zero.
    async fn clear_registers(&self, slots: &SlotPool) -> Result<()> {
        let others = TableId::SLOT_REGISTERS
            .into_iter()
            .chain(TableId::COUNTERS)
            .filter(|table| *table != TableId::WorkerBitmap);
        RegisterClearer::new(others).clear(&self.ops).await?;
        slots.clear_all_bitmaps(&self.ops).await
    }

    async fn clear_locked(&self, state: &mut State) -> Result<usize> {
        state.phase = Phase::Draining;
        let workers = state.registry.len();
        info!("Clearing {} workers from job {}", workers, state.job_id);

        let aggregation_group = state.config.aggregation_group_id;
        let all_ports_group = state.config.all_ports_group_id;
        let result: Result<()> = async {
            state.multicast.clear_all(&self.ops, aggregation_group).await?;
            state.multicast.clear_all(&self.ops, all_ports_group).await?;
            self.purge_worker_entries().await?;
            state.slots.configure(state.slots.pool_size(), 0)?;
            self.clear_registers(&state.slots).await
        }
        .await;

        if let Err(e) = result {
            error!("Clearing job {} failed, staying in draining: {}", state.job_id, e);
            return Err(e);
        }

        state.registry.clear_all();
        state.job_size = None;
        state.job_id += 1;
        state.fresh = true;
        state.last_cleared_at = Some(Utc::now());
        state.phase = Phase::Ready;
        info!("Switch cleared, next job is {}", state.job_id);
        Ok(workers)
    }

    async fn admit_locked(&self, state: &mut State, request: AdmitRequest) -> Result<Admission> {
        state.require("admit_worker", &[Phase::Ready])?;
        let AdmitRequest {
            rank,
            job_size,
            role,
            address,
        } = request;

        let clears_previous_job =
            rank == 0 && role == WorkerRole::Aggregator && state.config.clear_on_rank_zero && !state.fresh;
        let dev_port = state.check_admission(rank, job_size, role, &address, clears_previous_job)?;

        if clears_previous_job {
            if state.registry.aggregators().any(|w| w.rank != 0) {
                warn!(
                    "Rank 0 connected after {} other workers; they are cleared with the previous job",
                    state.registry.len()
                );
            }
            info!("Rank 0 connected, clearing job {}", state.job_id);
            self.clear_locked(state).await?;
        }

        let worker = state.registry.admit(rank, job_size, address, role)?;

        let previous_job_size = state.job_size;
        if worker.is_aggregator() && previous_job_size != Some(job_size) {
            let pool_size = state.slots.pool_size();
            if let Err(e) = state.slots.configure(pool_size, job_size) {
                if let Err(rollback) = state.registry.remove(rank) {
                    error!("Failed to unregister rank {}: {}", rank, rollback);
                }
                return Err(e);
            }
            state.job_size = Some(job_size);
        }

        if let Err(e) = self.program_worker(state, &worker, dev_port).await {
            error!("Failed to program rank {}: {}", rank, e);
            if let Err(rollback) = self.unprogram_worker(state, &worker, dev_port).await {
                error!("Rollback of rank {} incomplete: {}", rank, rollback);
            }
            if let Err(rollback) = state.registry.remove(rank) {
                error!("Failed to unregister rank {}: {}", rank, rollback);
            }
            state.job_size = previous_job_size;
            let pool_size = state.slots.pool_size();
            if let Err(restore) = state.slots.configure(pool_size, previous_job_size.unwrap_or(0)) {
                error!("Failed to restore slot pool after rank {}: {}", rank, restore);
            }
            return Err(e);
        }

        state.fresh = false;
        info!(
            "Admitted rank {} ({}, {}) on dev_port {} in job {}",
            rank,
            worker.role,
            worker.address.transport(),
            dev_port,
            state.job_id
        );

        let rkey = match &worker.address {
            WorkerAddress::Roce { rkey, .. } => Some(*rkey),
            WorkerAddress::Udp { .. } => None,
        };
        Ok(Admission {
            switch_queue_pairs: worker.switch_queue_pairs(),
            worker,
            dev_port,
            job_id: state.job_id,
            switch_mac: state.config.switch_mac,
            switch_ipv4: state.config.switch_ipv4,
            udp_port: state.config.udp_port,
            udp_port_mask: state.config.udp_port_mask,
            pool_base: state.slots.pool_base(),
            pool_size: state.slots.pool_size(),
            complete_mask: state.slots.complete_mask(),
            rkey,
            cleared_previous_job: clears_previous_job,
        })
    }

    async fn program_worker(&self, state: &mut State, worker: &Worker, dev_port: u16) -> Result<()> {
        if worker.is_aggregator() {
            let params = state.admission_params();
            for entry in entries::admission_entries(&state.config, worker, params) {
                self.ops.install(entry.table, &entry.key, &entry.data).await?;
            }
            for entry in entries::egress_entries(worker, dev_port) {
                self.ops.install(entry.table, &entry.key, &entry.data).await?;
            }
            state
                .multicast
                .add_node(&self.ops, state.config.aggregation_group_id, worker.rid, dev_port)
                .await?;
        }
        state
            .multicast
            .add_node(&self.ops, state.config.all_ports_group_id, flood_rid(dev_port), dev_port)
            .await
    }

    /// Removes everything [`Inner::program_worker`] may have installed.
    /// Entries that are already gone are skipped.
    async fn unprogram_worker(&self, state: &mut State, worker: &Worker, dev_port: u16) -> Result<()> {
        if !state.dev_port_shared(worker, dev_port) {
            state
                .multicast
                .remove_node(&self.ops, state.config.all_ports_group_id, flood_rid(dev_port))
                .await?;
        }
        if worker.is_aggregator() {
            state
                .multicast
                .remove_node(&self.ops, state.config.aggregation_group_id, worker.rid)
                .await?;
            for entry in entries::egress_entries(worker, dev_port) {
                self.ops.remove(entry.table, &entry.key).await?;
            }
            let params = state.admission_params();
            for entry in entries::admission_entries(&state.config, worker, params) {
                self.ops.remove(entry.table, &entry.key).await?;
            }
        }
        Ok(())
    }

    async fn remove_locked(&self, state: &mut State, rank: u32) -> Result<Worker> {
        state.require("remove_worker", &[Phase::Ready])?;
        let worker = state
            .registry
            .get(rank)
            .cloned()
            .ok_or_else(|| ControlError::not_found(format!("worker with rank {}", rank)))?;
        let dev_port = state.worker_dev_port(&worker)?;

        self.unprogram_worker(state, &worker, dev_port).await?;
        let worker = state.registry.remove(rank)?;
        if state.registry.aggregators().next().is_none() {
            state.job_size = None;
        }
        info!("Removed rank {} from dev_port {}", rank, dev_port);
        Ok(worker)
    }
}
