// rust/switch-core/src/dataplane/schema.rs

//! Typed description of every table, register and counter the controller
//! programs.
//!
//! Field and action names are only ever spelled out here. Callers build keys
//! from the constants in [`field`] and [`action`], and both the static
//! definitions and the names exposed by the running switch program are
//! checked once at start-up, so a misspelling is a start-up failure instead
//! of a rejected RPC in the middle of an admission.

use std::collections::HashSet;
use std::fmt;

use crate::error::{ControlError, Result};

/// Number of cells in every per-slot register.
pub const REGISTER_SIZE: u32 = 22528;

/// Number of queue pairs tracked per worker by the RDMA counters.
pub const QUEUE_PAIRS_PER_WORKER: u32 = 512;

/// Key field names.
pub mod field {
    pub const MATCH_PRIORITY: &str = "$MATCH_PRIORITY";
    pub const PARSER_ERROR: &str = "ig_prsr_md.parser_err";
    pub const INGRESS_PORT: &str = "ig_intr_md.ingress_port";
    pub const IPV4_SRC: &str = "hdr.ipv4.src_addr";
    pub const IPV4_DST: &str = "hdr.ipv4.dst_addr";
    pub const ETH_SRC: &str = "hdr.ethernet.src_addr";
    pub const ETH_DST: &str = "hdr.ethernet.dst_addr";
    pub const UDP_DST_PORT: &str = "hdr.udp.dst_port";
    pub const PARTITION_KEY: &str = "hdr.ib_bth.partition_key";
    pub const OPCODE: &str = "hdr.ib_bth.opcode";
    pub const DST_QP: &str = "hdr.ib_bth.dst_qp";
    pub const EGRESS_RID: &str = "eg_intr_md.egress_rid";
    pub const EGRESS_PORT: &str = "eg_intr_md.egress_port";
    pub const WORKER_ID: &str = "eg_md.switchml_md.worker_id";
    pub const QUEUE_PAIR_INDEX: &str = "eg_md.switchml_md.queue_pair_index";
    pub const MGID: &str = "$MGID";
    pub const NODE_ID: &str = "$MULTICAST_NODE_ID";
}

/// Action names and their parameter names.
pub mod action {
    pub const SET_BITMAP: &str = "SwitchMLIngress.get_worker_bitmap.set_bitmap";
    pub const FORWARD: &str = "SwitchMLIngress.get_worker_bitmap.forward";
    pub const DROP: &str = "SwitchMLIngress.get_worker_bitmap.drop";
    pub const FIRST_PACKET: &str = "SwitchMLIngress.rdma_receiver.first_packet";
    pub const MIDDLE_PACKET: &str = "SwitchMLIngress.rdma_receiver.middle_packet";
    pub const LAST_PACKET: &str = "SwitchMLIngress.rdma_receiver.last_packet";
    pub const ONLY_PACKET: &str = "SwitchMLIngress.rdma_receiver.only_packet";
    pub const SET_DST_ADDR: &str = "SwitchMLEgress.set_dst_addr.set_dst_addr";
    pub const FILL_IN_ROCE_FIELDS: &str = "SwitchMLEgress.roce_sender.fill_in_roce_fields";
    pub const SET_QPN_AND_PSN: &str = "SwitchMLEgress.roce_sender.set_qpn_and_psn";
    pub const SET_EGRESS_PORT: &str = "SwitchMLIngress.forward.set_egress_port";
    pub const FLOOD: &str = "SwitchMLIngress.forward.flood";
    /// Fixed-function tables (multicast groups and nodes) have no action.
    pub const NONE: &str = "";

    pub mod param {
        pub const MGID: &str = "mgid";
        pub const PACKET_TYPE: &str = "packet_type";
        pub const NUM_WORKERS: &str = "num_workers";
        pub const WORKER_BITMAP: &str = "worker_bitmap";
        pub const COMPLETE_BITMAP: &str = "complete_bitmap";
        pub const POOL_BASE: &str = "pool_base";
        pub const POOL_SIZE_MINUS_1: &str = "pool_size_minus_1";
        pub const WORKER_TYPE: &str = "worker_type";
        pub const WORKER_ID: &str = "worker_id";
        pub const PACKET_SIZE: &str = "packet_size";
        pub const ETH_DST_ADDR: &str = "eth_dst_addr";
        pub const IP_DST_ADDR: &str = "ip_dst_addr";
        pub const DEST_MAC: &str = "dest_mac";
        pub const DEST_IP: &str = "dest_ip";
        pub const RKEY: &str = "rkey";
        pub const MESSAGE_SIZE: &str = "message_size";
        pub const QPN: &str = "qpn";
        pub const PSN: &str = "psn";
        pub const EGRESS_PORT: &str = "egress_port";
        pub const FLOOD_MGID: &str = "flood_mgid";
        pub const NODE_IDS: &str = "$MULTICAST_NODE_ID";
        pub const L1_XID_VALID: &str = "$MULTICAST_NODE_L1_XID_VALID";
        pub const L1_XIDS: &str = "$MULTICAST_NODE_L1_XID";
        pub const RID: &str = "$MULTICAST_RID";
        pub const DEV_PORTS: &str = "$DEV_PORT";
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Match,
    Register,
    Counter,
    MulticastGroup,
    MulticastNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Ternary,
}

#[derive(Debug)]
pub struct KeySchema {
    pub name: &'static str,
    pub match_kind: MatchKind,
}

#[derive(Debug)]
pub struct ActionSchema {
    pub name: &'static str,
    pub params: &'static [&'static str],
}

#[derive(Debug)]
pub struct TableSchema {
    pub name: &'static str,
    pub kind: TableKind,
    pub keys: &'static [KeySchema],
    pub actions: &'static [ActionSchema],
    /// Maximum number of entries, or number of cells for registers and counters.
    pub size: u32,
    /// Data fields of a register or counter cell.
    pub fields: &'static [&'static str],
}

impl TableSchema {
    pub fn key(&self, name: &str) -> Option<&KeySchema> {
        self.keys.iter().find(|k| k.name == name)
    }

    pub fn action(&self, name: &str) -> Option<&ActionSchema> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self.kind, TableKind::Register | TableKind::Counter)
    }
}

const fn exact(name: &'static str) -> KeySchema {
    KeySchema {
        name,
        match_kind: MatchKind::Exact,
    }
}

const fn ternary(name: &'static str) -> KeySchema {
    KeySchema {
        name,
        match_kind: MatchKind::Ternary,
    }
}

const fn register(name: &'static str, fields: &'static [&'static str]) -> TableSchema {
    TableSchema {
        name,
        kind: TableKind::Register,
        keys: &[],
        actions: &[],
        size: REGISTER_SIZE,
        fields,
    }
}

const fn counter(name: &'static str, size: u32) -> TableSchema {
    TableSchema {
        name,
        kind: TableKind::Counter,
        keys: &[],
        actions: &[],
        size,
        fields: &["$COUNTER_SPEC_PKTS"],
    }
}

use action::param as p;

const RDMA_RECEIVER_PARAMS: &[&str] = &[p::MGID, p::WORKER_TYPE, p::WORKER_ID, p::NUM_WORKERS, p::PACKET_SIZE, p::WORKER_BITMAP];

static GET_WORKER_BITMAP: TableSchema = TableSchema {
    name: "pipe.SwitchMLIngress.get_worker_bitmap.get_worker_bitmap",
    kind: TableKind::Match,
    keys: &[
        exact(field::MATCH_PRIORITY),
        ternary(field::PARSER_ERROR),
        ternary(field::INGRESS_PORT),
        ternary(field::IPV4_SRC),
        ternary(field::IPV4_DST),
        ternary(field::ETH_SRC),
        ternary(field::ETH_DST),
        ternary(field::UDP_DST_PORT),
        ternary(field::PARTITION_KEY),
        ternary(field::DST_QP),
    ],
    actions: &[
        ActionSchema {
            name: action::SET_BITMAP,
            params: &[
                p::MGID,
                p::PACKET_TYPE,
                p::NUM_WORKERS,
                p::WORKER_BITMAP,
                p::COMPLETE_BITMAP,
                p::POOL_BASE,
                p::POOL_SIZE_MINUS_1,
            ],
        },
        ActionSchema {
            name: action::FORWARD,
            params: &[],
        },
        ActionSchema {
            name: action::DROP,
            params: &[],
        },
    ],
    size: 1024,
    fields: &[],
};

static RDMA_RECEIVER: TableSchema = TableSchema {
    name: "pipe.SwitchMLIngress.rdma_receiver.receive_roce",
    kind: TableKind::Match,
    keys: &[
        exact(field::MATCH_PRIORITY),
        ternary(field::IPV4_SRC),
        ternary(field::IPV4_DST),
        ternary(field::PARTITION_KEY),
        ternary(field::OPCODE),
        ternary(field::DST_QP),
    ],
    actions: &[
        ActionSchema {
            name: action::FIRST_PACKET,
            params: RDMA_RECEIVER_PARAMS,
        },
        ActionSchema {
            name: action::MIDDLE_PACKET,
            params: RDMA_RECEIVER_PARAMS,
        },
        ActionSchema {
            name: action::LAST_PACKET,
            params: RDMA_RECEIVER_PARAMS,
        },
        ActionSchema {
            name: action::ONLY_PACKET,
            params: RDMA_RECEIVER_PARAMS,
        },
    ],
    size: 1024,
    fields: &[],
};

static SET_DST_ADDR: TableSchema = TableSchema {
    name: "pipe.SwitchMLEgress.set_dst_addr.set_dst_addr",
    kind: TableKind::Match,
    keys: &[
        exact(field::MATCH_PRIORITY),
        ternary(field::EGRESS_RID),
        ternary(field::EGRESS_PORT),
    ],
    actions: &[ActionSchema {
        name: action::SET_DST_ADDR,
        params: &[p::ETH_DST_ADDR, p::IP_DST_ADDR],
    }],
    size: 1024,
    fields: &[],
};

static ROCE_SENDER_WORKER: TableSchema = TableSchema {
    name: "pipe.SwitchMLEgress.roce_sender.create_roce_packet",
    kind: TableKind::Match,
    keys: &[exact(field::WORKER_ID)],
    actions: &[ActionSchema {
        name: action::FILL_IN_ROCE_FIELDS,
        params: &[p::DEST_MAC, p::DEST_IP, p::RKEY, p::PACKET_SIZE, p::MESSAGE_SIZE],
    }],
    size: 64,
    fields: &[],
};

static ROCE_SENDER_QUEUE_PAIR: TableSchema = TableSchema {
    name: "pipe.SwitchMLEgress.roce_sender.fill_in_qpn_and_psn",
    kind: TableKind::Match,
    keys: &[exact(field::WORKER_ID), exact(field::QUEUE_PAIR_INDEX)],
    actions: &[ActionSchema {
        name: action::SET_QPN_AND_PSN,
        params: &[p::QPN, p::PSN],
    }],
    size: 32 * QUEUE_PAIRS_PER_WORKER,
    fields: &[],
};

static FORWARD: TableSchema = TableSchema {
    name: "pipe.SwitchMLIngress.forward.forward",
    kind: TableKind::Match,
    keys: &[exact(field::ETH_DST)],
    actions: &[
        ActionSchema {
            name: action::SET_EGRESS_PORT,
            params: &[p::EGRESS_PORT],
        },
        ActionSchema {
            name: action::FLOOD,
            params: &[p::FLOOD_MGID],
        },
    ],
    size: 1024,
    fields: &[],
};

static PRE_MGID: TableSchema = TableSchema {
    name: "$pre.mgid",
    kind: TableKind::MulticastGroup,
    keys: &[exact(field::MGID)],
    actions: &[ActionSchema {
        name: action::NONE,
        params: &[p::NODE_IDS, p::L1_XID_VALID, p::L1_XIDS],
    }],
    size: 65536,
    fields: &[],
};

static PRE_NODE: TableSchema = TableSchema {
    name: "$pre.node",
    kind: TableKind::MulticastNode,
    keys: &[exact(field::NODE_ID)],
    actions: &[ActionSchema {
        name: action::NONE,
        params: &[p::RID, p::DEV_PORTS],
    }],
    size: 65536,
    fields: &[],
};

static WORKER_BITMAP: TableSchema = register(
    "pipe.SwitchMLIngress.update_and_check_worker_bitmap.worker_bitmap",
    &["worker_bitmap.first", "worker_bitmap.second"],
);
static WORKER_COUNT: TableSchema = register("pipe.SwitchMLIngress.count_workers.worker_count", &["worker_count.f1"]);
static EXPONENT_MAX: TableSchema = register(
    "pipe.SwitchMLIngress.exponent_max.exponents",
    &["exponents.first", "exponents.second"],
);
static SIGNIFICANDS: TableSchema = register(
    "pipe.SwitchMLIngress.significand_sum.significands",
    &["significands.first", "significands.second"],
);

static RDMA_PACKET_COUNTER: TableSchema =
    counter("pipe.SwitchMLIngress.rdma_receiver.rdma_packet_counter", 32 * QUEUE_PAIRS_PER_WORKER);
static RDMA_MESSAGE_COUNTER: TableSchema =
    counter("pipe.SwitchMLIngress.rdma_receiver.rdma_message_counter", 32 * QUEUE_PAIRS_PER_WORKER);
static RDMA_SEQUENCE_VIOLATION_COUNTER: TableSchema = counter(
    "pipe.SwitchMLIngress.rdma_receiver.rdma_sequence_violation_counter",
    32 * QUEUE_PAIRS_PER_WORKER,
);
static SIMULATED_DROP_COUNTER: TableSchema = counter(
    "pipe.SwitchMLIngress.egress_drop_sim.simulated_drop_packet_counter",
    32 * QUEUE_PAIRS_PER_WORKER,
);
static RECIRCULATE_COUNTER: TableSchema =
    counter("pipe.SwitchMLIngress.next_step.recirculate_counter", REGISTER_SIZE);
static BROADCAST_COUNTER: TableSchema = counter("pipe.SwitchMLIngress.next_step.broadcast_counter", REGISTER_SIZE);
static RETRANSMIT_COUNTER: TableSchema =
    counter("pipe.SwitchMLIngress.next_step.retransmit_counter", REGISTER_SIZE);
static DROP_COUNTER: TableSchema = counter("pipe.SwitchMLIngress.next_step.drop_counter", REGISTER_SIZE);

/// Every dataplane object the controller touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableId {
    GetWorkerBitmap,
    RdmaReceiver,
    SetDstAddr,
    RoceSenderWorker,
    RoceSenderQueuePair,
    Forward,
    PreMgid,
    PreNode,
    WorkerBitmap,
    WorkerCount,
    ExponentMax,
    Significands,
    RdmaPacketCounter,
    RdmaMessageCounter,
    RdmaSequenceViolationCounter,
    SimulatedDropCounter,
    RecirculateCounter,
    BroadcastCounter,
    RetransmitCounter,
    DropCounter,
}

impl TableId {
    pub const ALL: [TableId; 20] = [
        Self::GetWorkerBitmap,
        Self::RdmaReceiver,
        Self::SetDstAddr,
        Self::RoceSenderWorker,
        Self::RoceSenderQueuePair,
        Self::Forward,
        Self::PreMgid,
        Self::PreNode,
        Self::WorkerBitmap,
        Self::WorkerCount,
        Self::ExponentMax,
        Self::Significands,
        Self::RdmaPacketCounter,
        Self::RdmaMessageCounter,
        Self::RdmaSequenceViolationCounter,
        Self::SimulatedDropCounter,
        Self::RecirculateCounter,
        Self::BroadcastCounter,
        Self::RetransmitCounter,
        Self::DropCounter,
    ];

    /// Per-worker admission and egress tables. Purged when workers are cleared.
    pub const PER_WORKER: [TableId; 5] = [
        Self::GetWorkerBitmap,
        Self::RdmaReceiver,
        Self::SetDstAddr,
        Self::RoceSenderWorker,
        Self::RoceSenderQueuePair,
    ];

    /// Slot-indexed registers holding aggregation state.
    pub const SLOT_REGISTERS: [TableId; 4] = [
        Self::WorkerBitmap,
        Self::WorkerCount,
        Self::ExponentMax,
        Self::Significands,
    ];

    /// Indexed packet counters.
    pub const COUNTERS: [TableId; 8] = [
        Self::RdmaPacketCounter,
        Self::RdmaMessageCounter,
        Self::RdmaSequenceViolationCounter,
        Self::SimulatedDropCounter,
        Self::RecirculateCounter,
        Self::BroadcastCounter,
        Self::RetransmitCounter,
        Self::DropCounter,
    ];

    pub fn schema(self) -> &'static TableSchema {
        match self {
            Self::GetWorkerBitmap => &GET_WORKER_BITMAP,
            Self::RdmaReceiver => &RDMA_RECEIVER,
            Self::SetDstAddr => &SET_DST_ADDR,
            Self::RoceSenderWorker => &ROCE_SENDER_WORKER,
            Self::RoceSenderQueuePair => &ROCE_SENDER_QUEUE_PAIR,
            Self::Forward => &FORWARD,
            Self::PreMgid => &PRE_MGID,
            Self::PreNode => &PRE_NODE,
            Self::WorkerBitmap => &WORKER_BITMAP,
            Self::WorkerCount => &WORKER_COUNT,
            Self::ExponentMax => &EXPONENT_MAX,
            Self::Significands => &SIGNIFICANDS,
            Self::RdmaPacketCounter => &RDMA_PACKET_COUNTER,
            Self::RdmaMessageCounter => &RDMA_MESSAGE_COUNTER,
            Self::RdmaSequenceViolationCounter => &RDMA_SEQUENCE_VIOLATION_COUNTER,
            Self::SimulatedDropCounter => &SIMULATED_DROP_COUNTER,
            Self::RecirculateCounter => &RECIRCULATE_COUNTER,
            Self::BroadcastCounter => &BROADCAST_COUNTER,
            Self::RetransmitCounter => &RETRANSMIT_COUNTER,
            Self::DropCounter => &DROP_COUNTER,
        }
    }

    pub fn name(self) -> &'static str {
        self.schema().name
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Start-up checks over the static table definitions.
pub struct Schema;

impl Schema {
    /// Checks the internal consistency of every definition.
    pub fn validate() -> Result<()> {
        let mut names = HashSet::new();
        for id in TableId::ALL {
            let schema = id.schema();
            if !names.insert(schema.name) {
                return Err(ControlError::schema(format!("duplicate table name '{}'", schema.name)));
            }
            if schema.size == 0 {
                return Err(ControlError::schema(format!("table '{}' has zero size", schema.name)));
            }

            if schema.is_indexed() {
                if schema.fields.is_empty() {
                    return Err(ControlError::schema(format!("register '{}' has no data fields", schema.name)));
                }
                if !schema.keys.is_empty() || !schema.actions.is_empty() {
                    return Err(ControlError::schema(format!(
                        "register '{}' must not declare keys or actions",
                        schema.name
                    )));
                }
                continue;
            }

            if schema.keys.is_empty() || schema.actions.is_empty() {
                return Err(ControlError::schema(format!(
                    "table '{}' needs at least one key field and one action",
                    schema.name
                )));
            }
            let mut keys = HashSet::new();
            for key in schema.keys {
                if !keys.insert(key.name) {
                    return Err(ControlError::schema(format!(
                        "table '{}' declares key field '{}' twice",
                        schema.name, key.name
                    )));
                }
            }
            let mut actions = HashSet::new();
            for action in schema.actions {
                if !actions.insert(action.name) {
                    return Err(ControlError::schema(format!(
                        "table '{}' declares action '{}' twice",
                        schema.name, action.name
                    )));
                }
                let mut params = HashSet::new();
                if let Some(dup) = action.params.iter().find(|p| !params.insert(**p)) {
                    return Err(ControlError::schema(format!(
                        "action '{}' of table '{}' declares parameter '{}' twice",
                        action.name, schema.name, dup
                    )));
                }
            }
        }
        Ok(())
    }

    /// Checks that the loaded switch program exposes every table.
    pub fn check_exposed(exposed: &[String]) -> Result<()> {
        let exposed: HashSet<&str> = exposed.iter().map(String::as_str).collect();
        let missing: Vec<&str> = TableId::ALL
            .iter()
            .map(|id| id.name())
            .filter(|name| !exposed.contains(name))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ControlError::schema(format!(
                "switch program does not expose: {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_schema_is_valid() {
        Schema::validate().unwrap();
    }

    #[test]
    fn test_check_exposed_reports_missing_tables() {
        let mut names: Vec<String> = TableId::ALL.iter().map(|id| id.name().to_string()).collect();
        assert!(Schema::check_exposed(&names).is_ok());

        names.retain(|n| n != TableId::PreNode.name());
        let err = Schema::check_exposed(&names).unwrap_err();
        assert_eq!(err.kind(), "Schema");
        assert!(err.to_string().contains("$pre.node"));
    }

    #[test]
    fn test_bitmap_register_has_one_field_per_set() {
        let schema = TableId::WorkerBitmap.schema();
        assert_eq!(schema.kind, TableKind::Register);
        assert_eq!(schema.fields.len(), 2);
        assert_eq!(schema.size, REGISTER_SIZE);
    }

    #[test]
    fn test_lookup_helpers() {
        let schema = TableId::GetWorkerBitmap.schema();
        assert_eq!(schema.key(field::UDP_DST_PORT).map(|k| k.match_kind), Some(MatchKind::Ternary));
        assert!(schema.key(field::OPCODE).is_none());
        assert_eq!(schema.action(action::SET_BITMAP).map(|a| a.params.len()), Some(7));
        assert!(!schema.is_indexed());
    }
}
