// rust/switch-core/src/job/worker.rs

//! Worker identity, addressing and queue-pair numbering.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataplane::QUEUE_PAIRS_PER_WORKER;
use crate::error::{ControlError, Result};

/// Worker bitmaps are 32 bits wide.
pub const MAX_WORKERS: u32 = 32;

/// Replication ids at or above this value identify flood copies, one per
/// device port, so that egress rewrites keyed by worker rid never apply to them.
pub const FLOOD_RID_BASE: u16 = 0x8000;

/// Switch-side queue pair numbers have the top bit of the 24-bit QPN set.
pub const SWITCH_QPN_BASE: u32 = 0x80_0000;

/// Mask selecting the rank bits of a switch-side QPN.
pub const SWITCH_QPN_MASK: u32 = 0xff_0000;

/// An Ethernet MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Builds an address from the low 48 bits of `value`.
    pub fn from_u64(value: u64) -> Self {
        let bytes = value.to_be_bytes();
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&bytes[2..]);
        Self(octets)
    }

    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl FromStr for MacAddr {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(ControlError::invalid_request(format!("invalid MAC address '{}'", s)));
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.is_empty() || part.len() > 2 {
                return Err(ControlError::invalid_request(format!("invalid MAC address '{}'", s)));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| ControlError::invalid_request(format!("invalid MAC address '{}'", s)))?;
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ControlError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// RoCE path MTU, encoded the way the dataplane expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketSize {
    Mtu128,
    Mtu256,
    Mtu512,
    Mtu1024,
}

impl PacketSize {
    pub fn from_bytes(bytes: u32) -> Result<Self> {
        match bytes {
            128 => Ok(Self::Mtu128),
            256 => Ok(Self::Mtu256),
            512 => Ok(Self::Mtu512),
            1024 => Ok(Self::Mtu1024),
            other => Err(ControlError::invalid_request(format!(
                "unsupported packet size {}; expected 128, 256, 512 or 1024",
                other
            ))),
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            Self::Mtu128 => 128,
            Self::Mtu256 => 256,
            Self::Mtu512 => 512,
            Self::Mtu1024 => 1024,
        }
    }

    pub fn code(self) -> u64 {
        match self {
            Self::Mtu128 => 0,
            Self::Mtu256 => 1,
            Self::Mtu512 => 2,
            Self::Mtu1024 => 3,
        }
    }
}

/// How a worker takes part in a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    /// Contributes to aggregation and receives results.
    Aggregator,
    /// Only receives flooded and broadcast traffic.
    Endpoint,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aggregator => f.write_str("aggregator"),
            Self::Endpoint => f.write_str("endpoint"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Udp,
    Roce,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => f.write_str("udp"),
            Self::Roce => f.write_str("roce"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePair {
    pub qpn: u32,
    pub psn: u32,
}

/// Where the switch sends a worker's results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerAddress {
    Udp {
        mac: MacAddr,
        ipv4: Ipv4Addr,
    },
    Roce {
        mac: MacAddr,
        ipv4: Ipv4Addr,
        rkey: u32,
        packet_size: PacketSize,
        message_size: u32,
        /// The worker's own queue pairs, in index order.
        queue_pairs: Vec<QueuePair>,
    },
}

impl WorkerAddress {
    pub fn mac(&self) -> MacAddr {
        match self {
            Self::Udp { mac, .. } | Self::Roce { mac, .. } => *mac,
        }
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        match self {
            Self::Udp { ipv4, .. } | Self::Roce { ipv4, .. } => *ipv4,
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            Self::Udp { .. } => Transport::Udp,
            Self::Roce { .. } => Transport::Roce,
        }
    }

    /// Worker type code carried in admission entries.
    pub fn worker_type(&self) -> u64 {
        match self {
            Self::Udp { .. } => 1,
            Self::Roce { .. } => 2,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mac = self.mac();
        if mac.is_zero() || mac.is_broadcast() {
            return Err(ControlError::invalid_request(format!("worker MAC {} is not unicast", mac)));
        }
        if let Self::Roce {
            packet_size,
            message_size,
            queue_pairs,
            ..
        } = self
        {
            if queue_pairs.is_empty() || queue_pairs.len() > QUEUE_PAIRS_PER_WORKER as usize {
                return Err(ControlError::invalid_request(format!(
                    "RoCE workers need between 1 and {} queue pairs, got {}",
                    QUEUE_PAIRS_PER_WORKER,
                    queue_pairs.len()
                )));
            }
            if *message_size < packet_size.bytes() {
                return Err(ControlError::invalid_request(format!(
                    "message size {} is smaller than packet size {}",
                    message_size,
                    packet_size.bytes()
                )));
            }
        }
        Ok(())
    }
}

/// Switch-side QPN for queue pair `index` of the worker with the given rank.
pub fn switch_qpn(rank: u32, index: u32) -> u32 {
    SWITCH_QPN_BASE | ((rank & 0xff) << 16) | (index & 0xffff)
}

/// The QPN bits that identify a worker in RDMA admission entries.
pub fn qpn_top_bits(rid: u16) -> u32 {
    SWITCH_QPN_BASE | ((u32::from(rid) & 0xff) << 16)
}

/// Replication id of the flood copy sent out of `dev_port`.
pub fn flood_rid(dev_port: u16) -> u16 {
    FLOOD_RID_BASE + dev_port
}

/// One admitted participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub rank: u32,
    /// Replication id of this worker's copy in the aggregation group.
    pub rid: u16,
    /// `1 << rank`
    pub bit_mask: u32,
    pub role: WorkerRole,
    pub address: WorkerAddress,
    pub admitted_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(rank: u32, role: WorkerRole, address: WorkerAddress) -> Self {
        Self {
            rank,
            rid: rank as u16,
            bit_mask: 1u32 << rank,
            role,
            address,
            admitted_at: Utc::now(),
        }
    }

    pub fn is_aggregator(&self) -> bool {
        self.role == WorkerRole::Aggregator
    }

    /// Queue pairs the switch uses towards this worker. Empty for UDP workers.
    pub fn switch_queue_pairs(&self) -> Vec<QueuePair> {
        match &self.address {
            WorkerAddress::Roce { queue_pairs, .. } => (0..queue_pairs.len() as u32)
                .map(|index| QueuePair {
                    qpn: switch_qpn(self.rank, index),
                    psn: index,
                })
                .collect(),
            WorkerAddress::Udp { .. } => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roce(queue_pairs: usize) -> WorkerAddress {
        WorkerAddress::Roce {
            mac: "b8:83:03:73:a6:a0".parse().unwrap(),
            ipv4: Ipv4Addr::new(10, 0, 0, 1),
            rkey: 0xabcd,
            packet_size: PacketSize::Mtu256,
            message_size: 1 << 16,
            queue_pairs: (0..queue_pairs as u32).map(|i| QueuePair { qpn: 100 + i, psn: i }).collect(),
        }
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "0C:42:A1:DD:59:90".parse().unwrap();
        assert_eq!(mac.to_string(), "0c:42:a1:dd:59:90");
        assert_eq!(mac.to_u64(), 0x0c42_a1dd_5990);
        assert_eq!(MacAddr::from_u64(0x0c42_a1dd_5990), mac);
        assert_eq!("0c-42-a1-dd-59-90".parse::<MacAddr>().unwrap(), mac);
    }

    #[test]
    fn test_mac_parse_errors() {
        assert!("0c:42:a1:dd:59".parse::<MacAddr>().is_err());
        assert!("0c:42:a1:dd:59:9g".parse::<MacAddr>().is_err());
        assert!("0c:42:a1:dd:59:990".parse::<MacAddr>().is_err());
        assert!("".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_packet_size_codes() {
        assert_eq!(PacketSize::from_bytes(128).unwrap().code(), 0);
        assert_eq!(PacketSize::from_bytes(1024).unwrap().code(), 3);
        assert_eq!(PacketSize::Mtu512.bytes(), 512);
        assert!(PacketSize::from_bytes(4096).is_err());
    }

    #[test]
    fn test_worker_bit_mask() {
        for rank in 0..MAX_WORKERS {
            let worker = Worker::new(rank, WorkerRole::Aggregator, roce(1));
            assert_eq!(worker.bit_mask, 1 << rank);
            assert_eq!(u32::from(worker.rid), rank);
        }
    }

    #[test]
    fn test_switch_queue_pairs() {
        let worker = Worker::new(3, WorkerRole::Aggregator, roce(4));
        let qps = worker.switch_queue_pairs();
        assert_eq!(qps.len(), 4);
        assert_eq!(qps[0], QueuePair { qpn: 0x83_0000, psn: 0 });
        assert_eq!(qps[3], QueuePair { qpn: 0x83_0003, psn: 3 });
        assert_eq!(qps[2].qpn & SWITCH_QPN_MASK, qpn_top_bits(worker.rid));
    }

    #[test]
    fn test_udp_worker_has_no_queue_pairs() {
        let address = WorkerAddress::Udp {
            mac: MacAddr::from_u64(1),
            ipv4: Ipv4Addr::UNSPECIFIED,
        };
        let worker = Worker::new(0, WorkerRole::Endpoint, address);
        assert!(worker.switch_queue_pairs().is_empty());
        assert_eq!(worker.address.transport(), Transport::Udp);
    }

    #[test]
    fn test_address_validation() {
        assert!(roce(1).validate().is_ok());
        assert!(roce(512).validate().is_ok());
        assert!(roce(0).validate().is_err());
        assert!(roce(513).validate().is_err());

        let broadcast = WorkerAddress::Udp {
            mac: MacAddr::BROADCAST,
            ipv4: Ipv4Addr::new(10, 0, 0, 1),
        };
        assert!(broadcast.validate().is_err());
    }

    #[test]
    fn test_flood_rid() {
        assert_eq!(flood_rid(4), 0x8004);
        assert!(flood_rid(0) >= FLOOD_RID_BASE);
    }
}
