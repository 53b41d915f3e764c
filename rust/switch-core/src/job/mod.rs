// rust/switch-core/src/job/mod.rs

//! Job lifecycle: workers, slots, multicast groups and the coordinator that
//! keeps them consistent with the switch.

pub mod coordinator;
pub mod description;
pub mod entries;
pub mod multicast;
pub mod ports;
pub mod registers;
pub mod registry;
pub mod slots;
pub mod worker;

pub use coordinator::{
    Admission, AdmitRequest, CoordinatorStatus, JobCoordinator, Phase, QueuePairCounters, SlotCounters, WorkerCounters,
};
pub use description::{JobDescription, PlannedWorker};
pub use multicast::{MulticastGroupManager, MulticastNode};
pub use ports::PortMap;
pub use registers::RegisterClearer;
pub use registry::WorkerRegistry;
pub use slots::{BitmapUpdate, SlotBitmaps, SlotPool, SlotSet};
pub use worker::{
    MacAddr, PacketSize, QueuePair, Transport, Worker, WorkerAddress, WorkerRole, MAX_WORKERS,
};
