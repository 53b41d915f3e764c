//! gRPC service implementation for the switch controller.

use std::net::Ipv4Addr;

use tonic::{Request, Response, Status};

use crate::proto::switch_control_server::SwitchControl;
use crate::proto::{
    ClearCountersRequest, ClearCountersResponse, ClearWorkersRequest, ClearWorkersResponse,
    GetStatusRequest, GetStatusResponse, ListWorkersRequest, ListWorkersResponse, MulticastMember,
    QueuePairCounter, QueuePairCountersRequest, QueuePairCountersResponse, RdmaConnectRequest,
    RdmaConnectResponse, ReadBitmapsRequest, ReadBitmapsResponse, RemoveWorkerRequest,
    RemoveWorkerResponse, SlotBitmap, SlotCounter, SlotCountersRequest, SlotCountersResponse,
    UdpConnectRequest, UdpConnectResponse, WorkerInfo as ProtoWorkerInfo,
    WorkerRole as ProtoWorkerRole,
};

use switch_core::job::multicast::MulticastNode;
use switch_core::job::{MacAddr, PacketSize, QueuePair, QueuePairCounters, SlotBitmaps, SlotCounters};
use switch_core::{AdmitRequest, ControlError, JobCoordinator, Worker, WorkerAddress, WorkerRole};

/// Maps a coordinator error onto a gRPC status, keeping the error kind in
/// the message so clients can report it.
pub fn status_from(err: ControlError) -> Status {
    let message = format!("[{}] {}", err.kind(), err);
    match err {
        ControlError::CapacityExceeded { .. } => Status::resource_exhausted(message),
        ControlError::DuplicateRank { .. } => Status::already_exists(message),
        ControlError::NotFound { .. } => Status::not_found(message),
        ControlError::InvalidRequest { .. } => Status::invalid_argument(message),
        ControlError::NotReady { .. } => Status::failed_precondition(message),
        ControlError::DataplaneUnavailable { .. } => Status::unavailable(message),
        ControlError::StaleStateDetected { .. } => Status::data_loss(message),
        _ => Status::internal(message),
    }
}

fn mac_from_wire(mac: u64) -> Result<MacAddr, Status> {
    if mac >> 48 != 0 {
        return Err(status_from(ControlError::invalid_request(format!(
            "MAC {:#x} does not fit in 48 bits",
            mac
        ))));
    }
    Ok(MacAddr::from_u64(mac))
}

fn role_to_wire(role: WorkerRole) -> ProtoWorkerRole {
    match role {
        WorkerRole::Aggregator => ProtoWorkerRole::Aggregator,
        WorkerRole::Endpoint => ProtoWorkerRole::Endpoint,
    }
}

fn worker_info(worker: &Worker) -> ProtoWorkerInfo {
    let queue_pairs = match &worker.address {
        WorkerAddress::Roce { queue_pairs, .. } => queue_pairs.len() as u32,
        WorkerAddress::Udp { .. } => 0,
    };
    ProtoWorkerInfo {
        rank: worker.rank,
        rid: u32::from(worker.rid),
        bit_mask: worker.bit_mask,
        role: role_to_wire(worker.role) as i32,
        transport: worker.address.transport().to_string(),
        mac: worker.address.mac().to_u64(),
        ipv4: u32::from(worker.address.ipv4()),
        queue_pairs,
        admitted_at_ms: worker.admitted_at.timestamp_millis(),
    }
}

fn member(node: &MulticastNode) -> MulticastMember {
    MulticastMember {
        rid: u32::from(node.rid),
        node_id: node.node_id,
        dev_port: u32::from(node.dev_port),
    }
}

fn slot_bitmap(slot: &SlotBitmaps) -> SlotBitmap {
    SlotBitmap {
        pool_index: slot.pool_index,
        first: slot.sets[0],
        second: slot.sets[1],
    }
}

fn queue_pair_counter(counters: &QueuePairCounters) -> QueuePairCounter {
    QueuePairCounter {
        queue_pair: counters.queue_pair,
        packets: counters.packets,
        messages: counters.messages,
        sequence_violations: counters.sequence_violations,
        simulated_drops: counters.simulated_drops,
    }
}

fn slot_counter(counters: &SlotCounters) -> SlotCounter {
    SlotCounter {
        pool_index: counters.pool_index,
        set: counters.set.index() as u32,
        recirculated: counters.recirculated,
        broadcast: counters.broadcast,
        retransmitted: counters.retransmitted,
        dropped: counters.dropped,
    }
}

pub struct SwitchControlService {
    coordinator: JobCoordinator,
}

impl SwitchControlService {
    pub fn new(coordinator: JobCoordinator) -> Self {
        Self { coordinator }
    }
}

#[tonic::async_trait]
impl SwitchControl for SwitchControlService {
    async fn rdma_connect(
        &self,
        request: Request<RdmaConnectRequest>,
    ) -> Result<Response<RdmaConnectResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            "RdmaConnect from rank {} of {} (mac {:#x}, {} queue pairs)",
            req.my_rank,
            req.job_size,
            req.mac,
            req.qpns.len()
        );

        if req.qpns.len() != req.psns.len() {
            return Err(status_from(ControlError::invalid_request(format!(
                "{} qpns but {} psns",
                req.qpns.len(),
                req.psns.len()
            ))));
        }
        let message_size = u32::try_from(req.message_size).map_err(|_| {
            status_from(ControlError::invalid_request(format!(
                "message size {} is too large",
                req.message_size
            )))
        })?;
        let packet_size = PacketSize::from_bytes(req.packet_size).map_err(status_from)?;

        let address = WorkerAddress::Roce {
            mac: mac_from_wire(req.mac)?,
            ipv4: Ipv4Addr::from(req.ipv4),
            rkey: req.rkey,
            packet_size,
            message_size,
            queue_pairs: req
                .qpns
                .iter()
                .zip(&req.psns)
                .map(|(qpn, psn)| QueuePair { qpn: *qpn, psn: *psn })
                .collect(),
        };

        let admission = self
            .coordinator
            .admit_worker(AdmitRequest {
                rank: req.my_rank,
                job_size: req.job_size,
                role: WorkerRole::Aggregator,
                address,
            })
            .await
            .map_err(status_from)?;

        let response = RdmaConnectResponse {
            job_id: admission.job_id,
            macs: vec![admission.switch_mac.to_u64()],
            ipv4s: vec![u32::from(admission.switch_ipv4)],
            rkeys: admission.rkey.into_iter().collect(),
            qpns: admission.switch_queue_pairs.iter().map(|qp| qp.qpn).collect(),
            psns: admission.switch_queue_pairs.iter().map(|qp| qp.psn).collect(),
            cleared_previous_job: admission.cleared_previous_job,
        };
        Ok(Response::new(response))
    }

    async fn udp_connect(
        &self,
        request: Request<UdpConnectRequest>,
    ) -> Result<Response<UdpConnectResponse>, Status> {
        let req = request.into_inner();
        let role = match req.role() {
            ProtoWorkerRole::Aggregator => WorkerRole::Aggregator,
            ProtoWorkerRole::Endpoint => WorkerRole::Endpoint,
        };
        tracing::debug!("UdpConnect from rank {} of {} ({})", req.my_rank, req.job_size, role);

        let address = WorkerAddress::Udp {
            mac: mac_from_wire(req.mac)?,
            ipv4: Ipv4Addr::from(req.ipv4),
        };
        let admission = self
            .coordinator
            .admit_worker(AdmitRequest {
                rank: req.my_rank,
                job_size: req.job_size,
                role,
                address,
            })
            .await
            .map_err(status_from)?;

        let response = UdpConnectResponse {
            job_id: admission.job_id,
            switch_mac: admission.switch_mac.to_u64(),
            switch_ipv4: u32::from(admission.switch_ipv4),
            udp_port: u32::from(admission.udp_port),
            udp_port_mask: u32::from(admission.udp_port_mask),
            pool_base: admission.pool_base,
            pool_size: admission.pool_size,
            complete_mask: admission.complete_mask,
            cleared_previous_job: admission.cleared_previous_job,
        };
        Ok(Response::new(response))
    }

    async fn remove_worker(
        &self,
        request: Request<RemoveWorkerRequest>,
    ) -> Result<Response<RemoveWorkerResponse>, Status> {
        let req = request.into_inner();
        let worker = self
            .coordinator
            .remove_worker(req.rank)
            .await
            .map_err(status_from)?;
        Ok(Response::new(RemoveWorkerResponse {
            worker: Some(worker_info(&worker)),
        }))
    }

    async fn clear_workers(
        &self,
        _request: Request<ClearWorkersRequest>,
    ) -> Result<Response<ClearWorkersResponse>, Status> {
        let removed = self.coordinator.clear_all_workers().await.map_err(status_from)?;
        let next_job_id = self.coordinator.status().await.job_id;
        tracing::info!("ClearWorkers removed {} workers", removed);
        Ok(Response::new(ClearWorkersResponse {
            removed: removed as u32,
            next_job_id,
        }))
    }

    async fn list_workers(
        &self,
        _request: Request<ListWorkersRequest>,
    ) -> Result<Response<ListWorkersResponse>, Status> {
        let workers = self.coordinator.list_workers().await;
        Ok(Response::new(ListWorkersResponse {
            workers: workers.iter().map(worker_info).collect(),
        }))
    }

    async fn read_bitmaps(
        &self,
        request: Request<ReadBitmapsRequest>,
    ) -> Result<Response<ReadBitmapsResponse>, Status> {
        let req = request.into_inner();
        let slots = if req.inconsistent_only {
            self.coordinator.inconsistent_bitmaps().await
        } else {
            self.coordinator.read_bitmaps(req.start, req.count).await
        }
        .map_err(status_from)?;

        Ok(Response::new(ReadBitmapsResponse {
            slots: slots.iter().map(slot_bitmap).collect(),
        }))
    }

    async fn get_status(
        &self,
        _request: Request<GetStatusRequest>,
    ) -> Result<Response<GetStatusResponse>, Status> {
        let status = self.coordinator.status().await;
        Ok(Response::new(GetStatusResponse {
            phase: status.phase.to_string(),
            job_id: status.job_id,
            job_size: status.job_size.unwrap_or(0),
            workers: status.workers as u32,
            aggregators: status.aggregators as u32,
            pool_base: status.pool_base,
            pool_size: status.pool_size,
            complete_mask: status.complete_mask,
            aggregation_members: status.aggregation_members.iter().map(member).collect(),
            all_ports_members: status.all_ports_members.iter().map(member).collect(),
            last_cleared_at_ms: status
                .last_cleared_at
                .map(|t| t.timestamp_millis())
                .unwrap_or(0),
        }))
    }

    async fn queue_pair_counters(
        &self,
        request: Request<QueuePairCountersRequest>,
    ) -> Result<Response<QueuePairCountersResponse>, Status> {
        let req = request.into_inner();
        let counters = self
            .coordinator
            .queue_pair_counters(req.rank, req.start, req.count)
            .await
            .map_err(status_from)?;
        Ok(Response::new(QueuePairCountersResponse {
            rank: req.rank,
            queue_pairs: counters.iter().map(queue_pair_counter).collect(),
        }))
    }

    async fn slot_counters(
        &self,
        request: Request<SlotCountersRequest>,
    ) -> Result<Response<SlotCountersResponse>, Status> {
        let req = request.into_inner();
        let counters = self
            .coordinator
            .slot_counters(req.start, req.count)
            .await
            .map_err(status_from)?;
        Ok(Response::new(SlotCountersResponse {
            slots: counters.iter().map(slot_counter).collect(),
        }))
    }

    async fn clear_counters(
        &self,
        _request: Request<ClearCountersRequest>,
    ) -> Result<Response<ClearCountersResponse>, Status> {
        self.coordinator.clear_counters().await.map_err(status_from)?;
        tracing::info!("ClearCounters done");
        Ok(Response::new(ClearCountersResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use switch_core::config::PortConfig;
    use switch_core::retry::RetryConfig;
    use switch_core::{JobConfiguration, MemoryDataplane, TableOps};
    use tonic::Code;

    fn mac(index: u64) -> u64 {
        0x0200_0000_0000 + index
    }

    async fn service() -> SwitchControlService {
        let ports = (0..4u16)
            .map(|i| PortConfig {
                mac: MacAddr::from_u64(mac(u64::from(i))),
                dev_port: 4 * i,
                ipv4: None,
            })
            .collect();
        let config = JobConfiguration {
            ports,
            ..JobConfiguration::default()
        };
        let ops = TableOps::new(
            Arc::new(MemoryDataplane::new()),
            RetryConfig::no_retry(),
            Duration::from_secs(1),
        );
        let coordinator = JobCoordinator::new(ops, config).unwrap();
        coordinator.configure().await.unwrap();
        SwitchControlService::new(coordinator)
    }

    fn udp_request(rank: u32, job_size: u32) -> UdpConnectRequest {
        UdpConnectRequest {
            my_rank: rank,
            job_size,
            mac: mac(u64::from(rank)),
            ipv4: u32::from(Ipv4Addr::new(10, 0, 0, rank as u8 + 1)),
            role: ProtoWorkerRole::Aggregator as i32,
        }
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ControlError::capacity_exceeded(33, 32), Code::ResourceExhausted),
            (ControlError::duplicate_rank(1), Code::AlreadyExists),
            (ControlError::not_found("rank 3"), Code::NotFound),
            (ControlError::invalid_request("bad"), Code::InvalidArgument),
            (ControlError::stale_state("bits"), Code::DataLoss),
            (ControlError::internal("oops"), Code::Internal),
            (
                ControlError::NotReady {
                    operation: "admit_worker",
                    phase: "draining",
                    required: "ready",
                },
                Code::FailedPrecondition,
            ),
        ];
        for (err, code) in cases {
            let kind = err.kind();
            let status = status_from(err);
            assert_eq!(status.code(), code);
            assert!(status.message().starts_with(&format!("[{}]", kind)));
        }
    }

    #[tokio::test]
    async fn test_udp_connect() {
        let service = service().await;
        let response = service
            .udp_connect(Request::new(udp_request(1, 2)))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.switch_mac, 0x0600_0000_0001);
        assert_eq!(response.switch_ipv4, u32::from(Ipv4Addr::new(198, 19, 200, 200)));
        assert_eq!(response.udp_port, 0xbee0);
        assert_eq!(response.complete_mask, 0b11);

        let err = service
            .udp_connect(Request::new(udp_request(1, 2)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn test_rdma_connect() {
        let service = service().await;
        let request = RdmaConnectRequest {
            job_id: 0,
            my_rank: 3,
            job_size: 4,
            mac: mac(3),
            ipv4: u32::from(Ipv4Addr::new(10, 0, 0, 4)),
            rkey: 0x1234,
            packet_size: 256,
            message_size: 1 << 20,
            qpns: vec![0x11, 0x12, 0x13, 0x14],
            psns: vec![7, 7, 7, 7],
        };
        let response = service.rdma_connect(Request::new(request)).await.unwrap().into_inner();

        assert_eq!(response.rkeys, vec![0x1234]);
        assert_eq!(response.qpns, vec![0x83_0000, 0x83_0001, 0x83_0002, 0x83_0003]);
        assert_eq!(response.psns, vec![0, 1, 2, 3]);
        assert_eq!(response.macs, vec![0x0600_0000_0001]);
    }

    #[tokio::test]
    async fn test_rdma_connect_rejects_bad_input() {
        let service = service().await;
        let base = RdmaConnectRequest {
            job_id: 0,
            my_rank: 0,
            job_size: 1,
            mac: mac(0),
            ipv4: 0,
            rkey: 1,
            packet_size: 256,
            message_size: 4096,
            qpns: vec![1],
            psns: vec![1],
        };

        let mismatched = RdmaConnectRequest {
            psns: vec![],
            ..base.clone()
        };
        let err = service.rdma_connect(Request::new(mismatched)).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let odd_packet = RdmaConnectRequest {
            packet_size: 300,
            ..base.clone()
        };
        let err = service.rdma_connect(Request::new(odd_packet)).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let wide_mac = RdmaConnectRequest {
            mac: 1 << 50,
            ..base
        };
        let err = service.rdma_connect(Request::new(wide_mac)).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_admin_calls() {
        let service = service().await;
        for rank in 0..2 {
            service.udp_connect(Request::new(udp_request(rank, 2))).await.unwrap();
        }

        let listed = service
            .list_workers(Request::new(ListWorkersRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listed.workers.len(), 2);
        assert_eq!(listed.workers[1].bit_mask, 0b10);
        assert_eq!(listed.workers[1].transport, "udp");

        let status = service
            .get_status(Request::new(GetStatusRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(status.phase, "ready");
        assert_eq!(status.job_size, 2);
        assert_eq!(status.aggregation_members.len(), 2);

        let bitmaps = service
            .read_bitmaps(Request::new(ReadBitmapsRequest {
                start: 0,
                count: 4,
                inconsistent_only: false,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(bitmaps.slots.len(), 4);

        let removed = service
            .remove_worker(Request::new(RemoveWorkerRequest { rank: 1 }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(removed.worker.map(|w| w.rank), Some(1));

        let cleared = service
            .clear_workers(Request::new(ClearWorkersRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(cleared.removed, 1);
        assert_eq!(cleared.next_job_id, status.job_id + 1);
    }

    #[tokio::test]
    async fn test_counter_calls() {
        let service = service().await;
        service.udp_connect(Request::new(udp_request(0, 1))).await.unwrap();

        let slots = service
            .slot_counters(Request::new(SlotCountersRequest { start: 4, count: 2 }))
            .await
            .unwrap()
            .into_inner();
        let sets: Vec<(u32, u32)> = slots.slots.iter().map(|c| (c.pool_index, c.set)).collect();
        assert_eq!(sets, vec![(2, 0), (2, 1)]);
        assert!(slots.slots.iter().all(|c| c.dropped == 0));

        let queue_pairs = service
            .queue_pair_counters(Request::new(QueuePairCountersRequest {
                rank: 0,
                start: 0,
                count: 3,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(queue_pairs.queue_pairs.len(), 3);
        assert_eq!(queue_pairs.queue_pairs[2].queue_pair, 2);

        let err = service
            .queue_pair_counters(Request::new(QueuePairCountersRequest {
                rank: 3,
                start: 0,
                count: 1,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        service
            .clear_counters(Request::new(ClearCountersRequest {}))
            .await
            .unwrap();
        let listed = service
            .list_workers(Request::new(ListWorkersRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listed.workers.len(), 1);
    }
}
