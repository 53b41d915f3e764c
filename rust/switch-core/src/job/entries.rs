// rust/switch-core/src/job/entries.rs

//! Table entries programmed for the job and for each worker.
//!
//! Keys depend only on addresses and ids, never on the job size, so the same
//! builders serve admission, removal and rollback.

use std::net::Ipv4Addr;

use super::ports::PortMap;
use super::worker::{qpn_top_bits, MacAddr, Worker, WorkerAddress, SWITCH_QPN_MASK};
use crate::config::JobConfiguration;
use crate::dataplane::schema::{action, action::param, field};
use crate::dataplane::{ActionData, TableEntry, TableId, TableKey};

/// Priority of per-worker admission entries.
pub const WORKER_PRIORITY: u64 = 10;
/// Priorities of the catch-all admission entries; larger values match last.
pub const DEFAULT_FORWARD_PRIORITY: u64 = 0xfffe;
pub const DEFAULT_DROP_PRIORITY: u64 = 0xffff;

/// `packet_type_t.CONSUME`
const PACKET_TYPE_CONSUME: u64 = 0x1;

const MAC_MASK: u64 = 0xffff_ffff_ffff;
const IPV4_MASK: u64 = 0xffff_ffff;
const RID_MASK: u64 = 0xffff;
const DEV_PORT_MASK: u64 = 0x1ff;

/// UC RDMA WRITE opcodes and the receiver action handling each.
const RDMA_WRITE_OPCODES: [(u64, &str); 6] = [
    (0x26, action::FIRST_PACKET),
    (0x27, action::MIDDLE_PACKET),
    (0x28, action::LAST_PACKET),
    (0x29, action::LAST_PACKET),
    (0x2a, action::ONLY_PACKET),
    (0x2b, action::ONLY_PACKET),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgrammedEntry {
    pub table: TableId,
    pub key: TableKey,
    pub data: ActionData,
}

impl ProgrammedEntry {
    fn new(table: TableId, key: TableKey, data: ActionData) -> Self {
        Self { table, key, data }
    }
}

/// Job-wide parameters carried in every admission entry.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionParams {
    pub job_size: u32,
    pub complete_mask: u32,
    pub pool_base: u32,
    pub pool_size: u32,
}

fn ipv4_key(key: TableKey, name: &'static str, ip: Ipv4Addr) -> TableKey {
    // An unknown address matches any source.
    let mask = if ip.is_unspecified() { 0 } else { IPV4_MASK };
    key.ternary(name, u64::from(u32::from(ip)), mask)
}

/// Ingress entries that accept a worker's aggregation packets.
pub fn admission_entries(config: &JobConfiguration, worker: &Worker, params: AdmissionParams) -> Vec<ProgrammedEntry> {
    let mgid = u64::from(config.aggregation_group_id);
    match &worker.address {
        WorkerAddress::Udp { mac, ipv4 } => {
            let key = TableKey::new().exact(field::MATCH_PRIORITY, WORKER_PRIORITY);
            let key = ipv4_key(key, field::IPV4_SRC, *ipv4);
            let key = key
                .ternary(field::IPV4_DST, u64::from(u32::from(config.switch_ipv4)), IPV4_MASK)
                .ternary(field::ETH_SRC, mac.to_u64(), MAC_MASK)
                .ternary(field::ETH_DST, config.switch_mac.to_u64(), MAC_MASK)
                .ternary(
                    field::UDP_DST_PORT,
                    u64::from(config.udp_port),
                    u64::from(config.udp_port_mask),
                );
            let data = ActionData::new(action::SET_BITMAP)
                .param(param::MGID, mgid)
                .param(param::PACKET_TYPE, PACKET_TYPE_CONSUME)
                .param(param::NUM_WORKERS, u64::from(params.job_size))
                .param(param::WORKER_BITMAP, u64::from(worker.bit_mask))
                .param(param::COMPLETE_BITMAP, u64::from(params.complete_mask))
                .param(param::POOL_BASE, u64::from(params.pool_base))
                .param(param::POOL_SIZE_MINUS_1, u64::from(params.pool_size.saturating_sub(1)));
            vec![ProgrammedEntry::new(TableId::GetWorkerBitmap, key, data)]
        }
        WorkerAddress::Roce { ipv4, packet_size, .. } => RDMA_WRITE_OPCODES
            .into_iter()
            .map(|(opcode, receiver_action)| {
                let key = TableKey::new().exact(field::MATCH_PRIORITY, WORKER_PRIORITY);
                let key = ipv4_key(key, field::IPV4_SRC, *ipv4)
                    .ternary(field::IPV4_DST, u64::from(u32::from(config.switch_ipv4)), IPV4_MASK)
                    .ternary(field::PARTITION_KEY, u64::from(config.partition_key), 0xffff)
                    .ternary(field::OPCODE, opcode, 0xff)
                    .ternary(
                        field::DST_QP,
                        u64::from(qpn_top_bits(worker.rid)),
                        u64::from(SWITCH_QPN_MASK),
                    );
                let data = ActionData::new(receiver_action)
                    .param(param::MGID, mgid)
                    .param(param::WORKER_TYPE, worker.address.worker_type())
                    .param(param::WORKER_ID, u64::from(worker.rid))
                    .param(param::NUM_WORKERS, u64::from(params.job_size))
                    .param(param::PACKET_SIZE, packet_size.code())
                    .param(param::WORKER_BITMAP, u64::from(worker.bit_mask));
                ProgrammedEntry::new(TableId::RdmaReceiver, key, data)
            })
            .collect(),
    }
}

/// Egress entries that address a worker's copy of each result.
pub fn egress_entries(worker: &Worker, dev_port: u16) -> Vec<ProgrammedEntry> {
    let rid = u64::from(worker.rid);
    match &worker.address {
        WorkerAddress::Udp { mac, ipv4 } => {
            let key = TableKey::new()
                .exact(field::MATCH_PRIORITY, WORKER_PRIORITY)
                .ternary(field::EGRESS_RID, rid, RID_MASK)
                .ternary(field::EGRESS_PORT, u64::from(dev_port), DEV_PORT_MASK);
            let data = ActionData::new(action::SET_DST_ADDR)
                .param(param::ETH_DST_ADDR, mac.to_u64())
                .param(param::IP_DST_ADDR, u64::from(u32::from(*ipv4)));
            vec![ProgrammedEntry::new(TableId::SetDstAddr, key, data)]
        }
        WorkerAddress::Roce {
            mac,
            ipv4,
            rkey,
            packet_size,
            message_size,
            queue_pairs,
        } => {
            let mut entries = Vec::with_capacity(queue_pairs.len() + 1);
            entries.push(ProgrammedEntry::new(
                TableId::RoceSenderWorker,
                TableKey::new().exact(field::WORKER_ID, rid),
                ActionData::new(action::FILL_IN_ROCE_FIELDS)
                    .param(param::DEST_MAC, mac.to_u64())
                    .param(param::DEST_IP, u64::from(u32::from(*ipv4)))
                    .param(param::RKEY, u64::from(*rkey))
                    .param(param::PACKET_SIZE, packet_size.code())
                    .param(param::MESSAGE_SIZE, u64::from(*message_size)),
            ));
            entries.extend(queue_pairs.iter().zip(0u64..).map(|(qp, index)| {
                ProgrammedEntry::new(
                    TableId::RoceSenderQueuePair,
                    TableKey::new()
                        .exact(field::WORKER_ID, rid)
                        .exact(field::QUEUE_PAIR_INDEX, index),
                    ActionData::new(action::SET_QPN_AND_PSN)
                        .param(param::QPN, u64::from(qp.qpn))
                        .param(param::PSN, u64::from(qp.psn)),
                )
            }));
            entries
        }
    }
}

/// Catch-all admission entries: forward packets that parsed cleanly, drop the rest.
pub fn default_entries() -> Vec<ProgrammedEntry> {
    vec![
        ProgrammedEntry::new(
            TableId::GetWorkerBitmap,
            TableKey::new()
                .exact(field::MATCH_PRIORITY, DEFAULT_FORWARD_PRIORITY)
                .ternary(field::PARSER_ERROR, 0, 0xffff),
            ActionData::new(action::FORWARD),
        ),
        ProgrammedEntry::new(
            TableId::GetWorkerBitmap,
            TableKey::new().exact(field::MATCH_PRIORITY, DEFAULT_DROP_PRIORITY),
            ActionData::new(action::DROP),
        ),
    ]
}

/// Whether an installed entry survives worker clears.
pub fn is_default_entry(table: TableId, entry: &TableEntry) -> bool {
    table == TableId::GetWorkerBitmap && (entry.data.action == action::FORWARD || entry.data.action == action::DROP)
}

/// L2 forwarding for traffic outside aggregation, plus a broadcast flood to
/// every port.
pub fn forwarding_entries(ports: &PortMap, all_ports_group_id: u16) -> Vec<ProgrammedEntry> {
    let mut entries: Vec<ProgrammedEntry> = ports
        .iter()
        .map(|port| {
            ProgrammedEntry::new(
                TableId::Forward,
                TableKey::new().exact(field::ETH_DST, port.mac.to_u64()),
                ActionData::new(action::SET_EGRESS_PORT).param(param::EGRESS_PORT, u64::from(port.dev_port)),
            )
        })
        .collect();
    entries.push(ProgrammedEntry::new(
        TableId::Forward,
        TableKey::new().exact(field::ETH_DST, MacAddr::BROADCAST.to_u64()),
        ActionData::new(action::FLOOD).param(param::FLOOD_MGID, u64::from(all_ports_group_id)),
    ));
    entries
}

/// Rank of the worker an admission entry belongs to.
pub fn admission_rank(table: TableId, entry: &TableEntry) -> Option<u32> {
    match table {
        TableId::GetWorkerBitmap if entry.data.action == action::SET_BITMAP => entry
            .data
            .get_int(param::WORKER_BITMAP)
            .filter(|mask| mask.count_ones() == 1)
            .map(u64::trailing_zeros),
        TableId::RdmaReceiver => entry.data.get_int(param::WORKER_ID).map(|rid| rid as u32),
        _ => None,
    }
}
