// rust/switch-core/src/job/description.rs

//! Job description files.
//!
//! A job description lists the device ports whose machines take part in
//! aggregation:
//!
//! ```toml
//! worker_ports = [4, 12, 20]
//! transport = "udp"
//! ```
//!
//! Listed ports become aggregators with ranks in list order. Every other
//! port of the port map joins as an endpoint so that it still receives
//! flooded traffic.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ports::PortMap;
use super::worker::{Transport, WorkerAddress, WorkerRole, MAX_WORKERS};
use crate::error::{ControlError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescription {
    pub worker_ports: Vec<u16>,
    #[serde(default)]
    pub transport: Transport,
}

/// One admission derived from a job description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWorker {
    pub rank: u32,
    pub job_size: u32,
    pub role: WorkerRole,
    pub dev_port: u16,
    pub address: WorkerAddress,
}

impl FromStr for JobDescription {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ControlError::config_with_source("failed to parse job description", e))
    }
}

impl JobDescription {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ControlError::io(path, "failed to read job description", e))?;
        content.parse()
    }

    /// Resolves the description against the port map, in rank order.
    pub fn plan(&self, ports: &PortMap) -> Result<Vec<PlannedWorker>> {
        if self.transport != Transport::Udp {
            return Err(ControlError::invalid_request(
                "job descriptions only admit UDP workers; RoCE workers connect through RdmaConnect",
            ));
        }

        let mut listed = HashSet::new();
        if let Some(dup) = self.worker_ports.iter().find(|p| !listed.insert(**p)) {
            return Err(ControlError::invalid_request(format!("dev_port {} is listed twice", dup)));
        }

        let job_size = self.worker_ports.len() as u32;
        let endpoints: Vec<u16> = ports
            .iter()
            .map(|p| p.dev_port)
            .filter(|p| !listed.contains(p))
            .collect();
        let total = job_size + endpoints.len() as u32;
        if total > MAX_WORKERS {
            return Err(ControlError::capacity_exceeded(total, MAX_WORKERS));
        }

        let aggregators = self.worker_ports.iter().map(|p| (*p, WorkerRole::Aggregator));
        let others = endpoints.into_iter().map(|p| (p, WorkerRole::Endpoint));
        aggregators
            .chain(others)
            .zip(0u32..)
            .map(|((dev_port, role), rank)| {
                let port = ports.by_dev_port(dev_port)?;
                Ok(PlannedWorker {
                    rank,
                    job_size,
                    role,
                    dev_port,
                    address: WorkerAddress::Udp {
                        mac: port.mac,
                        ipv4: ports.ipv4(dev_port),
                    },
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;
    use crate::job::worker::MacAddr;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use tempfile::NamedTempFile;

    fn port_map(dev_ports: &[u16]) -> PortMap {
        let ports: Vec<PortConfig> = dev_ports
            .iter()
            .map(|p| PortConfig {
                mac: MacAddr::from_u64(0x0200_0000_0000 + u64::from(*p)),
                dev_port: *p,
                ipv4: None,
            })
            .collect();
        PortMap::new(&ports).unwrap()
    }

    #[test]
    fn test_parse() {
        let job: JobDescription = "worker_ports = [4, 12]".parse().unwrap();
        assert_eq!(job.worker_ports, vec![4, 12]);
        assert_eq!(job.transport, Transport::Udp);

        assert!("transport = \"udp\"".parse::<JobDescription>().is_err());
        assert!("worker_ports = [4]\ntransport = \"tcp\"".parse::<JobDescription>().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "worker_ports = [20, 4]\ntransport = \"udp\"").unwrap();
        let job = JobDescription::from_file(file.path()).unwrap();
        assert_eq!(job.worker_ports, vec![20, 4]);

        let err = JobDescription::from_file("/nonexistent/job.toml").unwrap_err();
        assert_eq!(err.kind(), "Io");
    }

    #[test]
    fn test_plan_assigns_ranks() {
        let ports = port_map(&[4, 12, 20, 28]);
        let job: JobDescription = "worker_ports = [20, 4]".parse().unwrap();
        let plan = job.plan(&ports).unwrap();

        let summary: Vec<(u32, u16, WorkerRole)> = plan.iter().map(|w| (w.rank, w.dev_port, w.role)).collect();
        assert_eq!(
            summary,
            vec![
                (0, 20, WorkerRole::Aggregator),
                (1, 4, WorkerRole::Aggregator),
                (2, 12, WorkerRole::Endpoint),
                (3, 28, WorkerRole::Endpoint),
            ]
        );
        assert!(plan.iter().all(|w| w.job_size == 2));
        assert_eq!(plan[0].address.ipv4(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_plan_errors() {
        let ports = port_map(&[4, 12]);

        let missing: JobDescription = "worker_ports = [4, 99]".parse().unwrap();
        assert_eq!(missing.plan(&ports).unwrap_err().kind(), "NotFound");

        let twice: JobDescription = "worker_ports = [4, 4]".parse().unwrap();
        assert_eq!(twice.plan(&ports).unwrap_err().kind(), "InvalidRequest");

        let roce: JobDescription = "worker_ports = [4]\ntransport = \"roce\"".parse().unwrap();
        assert_eq!(roce.plan(&ports).unwrap_err().kind(), "InvalidRequest");

        let many: Vec<u16> = (0..33).map(|p| p * 4).collect();
        let ports = port_map(&many);
        let job = JobDescription {
            worker_ports: many[..2].to_vec(),
            transport: Transport::Udp,
        };
        assert_eq!(job.plan(&ports).unwrap_err().kind(), "CapacityExceeded");
    }
}
