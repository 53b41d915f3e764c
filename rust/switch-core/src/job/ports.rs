// rust/switch-core/src/job/ports.rs

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use super::worker::MacAddr;
use crate::config::PortConfig;
use crate::error::{ControlError, Result};

/// Machines attached to the switch, indexed by MAC and by device port.
#[derive(Debug, Clone, Default)]
pub struct PortMap {
    by_mac: BTreeMap<MacAddr, PortConfig>,
    by_dev_port: BTreeMap<u16, MacAddr>,
}

impl PortMap {
    pub fn new(ports: &[PortConfig]) -> Result<Self> {
        let mut map = Self::default();
        for port in ports {
            if map.by_mac.contains_key(&port.mac) {
                return Err(ControlError::config(format!("port MAC {} is listed twice", port.mac)));
            }
            if map.by_dev_port.contains_key(&port.dev_port) {
                return Err(ControlError::config(format!("dev_port {} is listed twice", port.dev_port)));
            }
            map.by_dev_port.insert(port.dev_port, port.mac);
            map.by_mac.insert(port.mac, port.clone());
        }
        Ok(map)
    }

    pub fn dev_port(&self, mac: MacAddr) -> Result<u16> {
        self.by_mac
            .get(&mac)
            .map(|p| p.dev_port)
            .ok_or_else(|| ControlError::not_found(format!("port for MAC {}", mac)))
    }

    pub fn by_dev_port(&self, dev_port: u16) -> Result<&PortConfig> {
        self.by_dev_port
            .get(&dev_port)
            .and_then(|mac| self.by_mac.get(mac))
            .ok_or_else(|| ControlError::not_found(format!("dev_port {}", dev_port)))
    }

    /// The IPv4 address of the machine on `dev_port`, or `0.0.0.0` if none is known.
    pub fn ipv4(&self, dev_port: u16) -> Ipv4Addr {
        self.by_dev_port(dev_port)
            .ok()
            .and_then(|p| p.ipv4)
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    /// Ports in device-port order.
    pub fn iter(&self) -> impl Iterator<Item = &PortConfig> {
        self.by_dev_port.values().filter_map(|mac| self.by_mac.get(mac))
    }

    pub fn len(&self) -> usize {
        self.by_mac.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mac.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(mac: u64, dev_port: u16, ipv4: Option<Ipv4Addr>) -> PortConfig {
        PortConfig {
            mac: MacAddr::from_u64(mac),
            dev_port,
            ipv4,
        }
    }

    #[test]
    fn test_lookups() {
        let map = PortMap::new(&[
            port(0xa, 12, None),
            port(0xb, 4, Some(Ipv4Addr::new(10, 0, 0, 2))),
        ])
        .unwrap();

        assert_eq!(map.dev_port(MacAddr::from_u64(0xa)).unwrap(), 12);
        assert_eq!(map.dev_port(MacAddr::from_u64(0xc)).unwrap_err().kind(), "NotFound");
        assert_eq!(map.ipv4(4), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(map.ipv4(12), Ipv4Addr::UNSPECIFIED);
        assert_eq!(map.ipv4(99), Ipv4Addr::UNSPECIFIED);

        let order: Vec<u16> = map.iter().map(|p| p.dev_port).collect();
        assert_eq!(order, vec![4, 12]);
    }

    #[test]
    fn test_duplicates_rejected() {
        assert!(PortMap::new(&[port(1, 4, None), port(1, 8, None)]).is_err());
        assert!(PortMap::new(&[port(1, 4, None), port(2, 4, None)]).is_err());
    }
}
