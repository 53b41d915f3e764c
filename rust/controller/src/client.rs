//! Admin commands run against a live controller.

use std::fmt;
use std::net::Ipv4Addr;

use tonic::transport::Channel;
use tonic::Status;

use crate::proto::switch_control_client::SwitchControlClient;
use crate::proto::{
    ClearCountersRequest, ClearWorkersRequest, GetStatusRequest, ListWorkersRequest, MulticastMember,
    QueuePairCounter, QueuePairCountersRequest, ReadBitmapsRequest, RemoveWorkerRequest, SlotCounter,
    SlotCountersRequest, WorkerInfo, WorkerRole,
};

use switch_core::job::MacAddr;
use switch_core::ControlError;

/// Error reported by the CLI as `error [<kind>]: <message>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliError {
    pub kind: String,
    pub message: String,
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error [{}]: {}", self.kind, self.message)
    }
}

impl std::error::Error for CliError {}

impl From<ControlError> for CliError {
    fn from(err: ControlError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<Status> for CliError {
    fn from(status: Status) -> Self {
        // The server prefixes messages with "[<kind>] ".
        let message = status.message();
        if let Some((kind, rest)) = message
            .strip_prefix('[')
            .and_then(|m| m.split_once("] "))
        {
            return Self {
                kind: kind.to_string(),
                message: rest.to_string(),
            };
        }
        Self {
            kind: format!("{:?}", status.code()),
            message: message.to_string(),
        }
    }
}

impl From<tonic::transport::Error> for CliError {
    fn from(err: tonic::transport::Error) -> Self {
        Self {
            kind: "Transport".to_string(),
            message: err.to_string(),
        }
    }
}

pub type CliResult<T> = std::result::Result<T, CliError>;

pub async fn connect(server: &str) -> CliResult<SwitchControlClient<Channel>> {
    let endpoint = if server.contains("://") {
        server.to_string()
    } else {
        format!("http://{}", server)
    };
    Ok(SwitchControlClient::connect(endpoint).await?)
}

fn format_worker(worker: &WorkerInfo) -> String {
    let role = match worker.role() {
        WorkerRole::Aggregator => "aggregator",
        WorkerRole::Endpoint => "endpoint",
    };
    format!(
        "{:>4}  {:>#10x}  {:<10}  {:<4}  {}  {:<15}  {}",
        worker.rank,
        worker.bit_mask,
        role,
        worker.transport,
        MacAddr::from_u64(worker.mac),
        Ipv4Addr::from(worker.ipv4),
        worker.queue_pairs
    )
}

fn format_members(members: &[MulticastMember]) -> String {
    let parts: Vec<String> = members
        .iter()
        .map(|m| format!("{:#x}@{}", m.rid, m.dev_port))
        .collect();
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join(" ")
    }
}

pub async fn workers(server: &str) -> CliResult<()> {
    let mut client = connect(server).await?;
    let response = client.list_workers(ListWorkersRequest {}).await?.into_inner();
    println!("rank  bit_mask    role        xprt  mac                ipv4             qps");
    for worker in &response.workers {
        println!("{}", format_worker(worker));
    }
    Ok(())
}

pub async fn status(server: &str) -> CliResult<()> {
    let mut client = connect(server).await?;
    let status = client.get_status(GetStatusRequest {}).await?.into_inner();
    println!("phase:          {}", status.phase);
    println!("job id:         {}", status.job_id);
    println!("job size:       {}", status.job_size);
    println!("workers:        {} ({} aggregating)", status.workers, status.aggregators);
    println!("pool:           {}+{}", status.pool_base, status.pool_size);
    println!("complete mask:  {:#x}", status.complete_mask);
    println!("aggregation:    {}", format_members(&status.aggregation_members));
    println!("all ports:      {}", format_members(&status.all_ports_members));
    if let Some(cleared) = chrono::DateTime::from_timestamp_millis(status.last_cleared_at_ms) {
        if status.last_cleared_at_ms > 0 {
            println!("last cleared:   {}", cleared.to_rfc3339());
        }
    }
    Ok(())
}

pub async fn bitmaps(server: &str, start: u32, count: u32, inconsistent_only: bool) -> CliResult<()> {
    let mut client = connect(server).await?;
    let response = client
        .read_bitmaps(ReadBitmapsRequest {
            start,
            count,
            inconsistent_only,
        })
        .await?
        .into_inner();
    println!(" slot       set 0       set 1");
    for slot in &response.slots {
        println!("{:>5}  {:>#10x}  {:>#10x}", slot.pool_index, slot.first, slot.second);
    }
    Ok(())
}

pub async fn remove(server: &str, rank: u32) -> CliResult<()> {
    let mut client = connect(server).await?;
    let response = client
        .remove_worker(RemoveWorkerRequest { rank })
        .await?
        .into_inner();
    match response.worker {
        Some(worker) => println!("removed {}", format_worker(&worker).trim_start()),
        None => println!("removed rank {}", rank),
    }
    Ok(())
}

pub async fn clear(server: &str) -> CliResult<()> {
    let mut client = connect(server).await?;
    let response = client.clear_workers(ClearWorkersRequest {}).await?.into_inner();
    println!(
        "cleared {} workers; next job id {}",
        response.removed, response.next_job_id
    );
    Ok(())
}

fn format_slot_counter(counter: &SlotCounter) -> String {
    format!(
        "{:>5}  {:>3}  {:>13}  {:>13}  {:>13}  {:>13}",
        counter.pool_index,
        counter.set,
        counter.recirculated,
        counter.broadcast,
        counter.retransmitted,
        counter.dropped
    )
}

fn format_queue_pair_counter(counter: &QueuePairCounter) -> String {
    format!(
        "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}",
        counter.queue_pair, counter.packets, counter.messages, counter.sequence_violations, counter.simulated_drops
    )
}

pub async fn slot_counters(server: &str, start: u32, count: u32) -> CliResult<()> {
    let mut client = connect(server).await?;
    let response = client
        .slot_counters(SlotCountersRequest { start, count })
        .await?
        .into_inner();
    println!(" slot  set   recirculated      broadcast  retransmitted        dropped");
    for counter in &response.slots {
        println!("{}", format_slot_counter(counter));
    }
    Ok(())
}

pub async fn queue_pair_counters(server: &str, rank: u32, start: u32, count: u32) -> CliResult<()> {
    let mut client = connect(server).await?;
    let response = client
        .queue_pair_counters(QueuePairCountersRequest { rank, start, count })
        .await?
        .into_inner();
    println!("rank {}", response.rank);
    println!("  qp        packets       messages     violations  simulated drops");
    for counter in &response.queue_pairs {
        println!("{}", format_queue_pair_counter(counter));
    }
    Ok(())
}

pub async fn clear_counters(server: &str) -> CliResult<()> {
    let mut client = connect(server).await?;
    client.clear_counters(ClearCountersRequest {}).await?;
    println!("counters cleared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_error_from_status_keeps_kind() {
        let err = CliError::from(Status::resource_exhausted(
            "[CapacityExceeded] job of 33 workers exceeds capacity of 32 workers",
        ));
        assert_eq!(err.kind, "CapacityExceeded");
        assert_eq!(
            err.to_string(),
            "error [CapacityExceeded]: job of 33 workers exceeds capacity of 32 workers"
        );

        let err = CliError::from(Status::new(Code::Unavailable, "connection refused"));
        assert_eq!(err.kind, "Unavailable");
        assert_eq!(err.message, "connection refused");
    }

    #[test]
    fn test_error_from_control_error() {
        let err = CliError::from(ControlError::not_found("rank 3"));
        assert_eq!(err.kind, "NotFound");
    }

    #[test]
    fn test_format_members() {
        assert_eq!(format_members(&[]), "-");
        let members = [MulticastMember {
            rid: 0x8004,
            node_id: 0x1235_8004,
            dev_port: 4,
        }];
        assert_eq!(format_members(&members), "0x8004@4");
    }

    #[test]
    fn test_format_counters() {
        let slot = SlotCounter {
            pool_index: 5,
            set: 1,
            recirculated: 0,
            broadcast: 2,
            retransmitted: 0,
            dropped: 9,
        };
        let line = format_slot_counter(&slot);
        assert!(line.starts_with("    5    1"));
        assert!(line.ends_with(" 9"));

        let queue_pair = QueuePairCounter {
            queue_pair: 3,
            packets: 40,
            messages: 5,
            sequence_violations: 0,
            simulated_drops: 1,
        };
        let formatted = format_queue_pair_counter(&queue_pair);
        let fields: Vec<&str> = formatted.split_whitespace().collect();
        assert_eq!(fields, vec!["3", "40", "5", "0", "1"]);
    }
}
