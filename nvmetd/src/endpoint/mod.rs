//! Per-connection endpoint worker: owns the TCP socket, drives the
//! ICReq/ICResp handshake, then loops `RECV_PDU -> HANDLE_PDU` dispatching
//! CapsuleCmd PDUs to the command dispatcher and streaming the response
//! back as CapsuleResp (+ C2HData for payloads too large for the
//! completion alone). Grounded on `common.h`'s `endpoint` struct and the
//! receive state machine described in SPEC_FULL.md §4.D.

pub mod tags;

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Protocol;
use crate::dispatcher::{Dispatcher, EndpointCtx};
use crate::wire::nvme::{self, Cqe, Sqe, CQE_LEN};
use crate::wire::pdu::{self, PduHeader, PduType};

use tags::TagTable;

/// Drives one accepted connection to completion. Runs on its own OS
/// thread (one thread per endpoint, per §5); returns when the peer
/// closes the connection, a fatal protocol error occurs, or `stop` is
/// set.
pub fn run(stream: TcpStream, dispatcher: Arc<Dispatcher>, stop: Arc<AtomicBool>) {
    let kato_timeout = Duration::from_millis(Protocol::KATO_INTERVAL_MS * Protocol::RETRY_COUNT as u64);
    if let Err(e) = stream.set_read_timeout(Some(Duration::from_millis(Protocol::KATO_INTERVAL_MS))) {
        tracing::warn!(error = %e, "failed to set read timeout on endpoint socket");
    }

    let peer = stream.peer_addr().ok();
    let mut reader = BufReader::new(stream.try_clone().expect("clone endpoint socket"));
    let mut writer = BufWriter::new(stream);

    if let Err(e) = handshake(&mut reader, &mut writer) {
        tracing::warn!(error = %e, peer = ?peer, "ICReq handshake failed");
        return;
    }

    let mut ep = EndpointCtx {
        qid: 0,
        qsize: Protocol::NVMF_DQ_DEPTH,
        hostnqn: None,
        cntlid: None,
    };
    let mut tags = TagTable::new(ep.qsize);
    let mut idle_ticks: u32 = 0;

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let hdr = match PduHeader::read_from(&mut reader) {
            Ok(hdr) => hdr,
            Err(crate::wire::error::WireError::Io { source })
                if source.kind() == std::io::ErrorKind::WouldBlock
                    || source.kind() == std::io::ErrorKind::TimedOut =>
            {
                idle_ticks += 1;
                if Duration::from_millis(Protocol::KATO_INTERVAL_MS) * idle_ticks >= kato_timeout {
                    tracing::info!(peer = ?peer, "endpoint idle past keep-alive timeout, closing");
                    break;
                }
                if let (Some(h), Some(c)) = (&ep.hostnqn, ep.cntlid) {
                    if let Some((command_id, events)) = dispatcher.sessions.take_ready_aen(h, c) {
                        let cqe = Cqe {
                            result: events,
                            command_id,
                            status: crate::wire::nvme::StatusCode::Success,
                        };
                        if pdu::write_capsule_resp(&mut writer, &cqe.encode()).is_err() {
                            break;
                        }
                    }
                }
                continue;
            }
            Err(_) => break,
        };
        idle_ticks = 0;

        match hdr.pdu_type {
            PduType::CapsuleCmd => {
                let capsule = match pdu::read_capsule_cmd(&mut reader, &hdr) {
                    Ok(c) => c,
                    Err(_) => break,
                };
                let sqe = Sqe::parse(&capsule.sqe);
                let slot = match tags.acquire(sqe.command_id) {
                    Some(s) => s,
                    None => {
                        let cqe = Cqe {
                            result: 0,
                            command_id: sqe.command_id,
                            status: crate::wire::nvme::StatusCode::NsNotReady,
                        };
                        let _ = pdu::write_capsule_resp(&mut writer, &cqe.encode());
                        continue;
                    }
                };
                let is_connect = sqe.opcode == nvme::OPC_FABRICS && sqe.fctype == nvme::FCTYPE_CONNECT;
                let response = dispatcher.dispatch(&mut ep, &sqe, &capsule.icd);
                tags.release(slot);

                if is_connect && response.cqe.status == crate::wire::nvme::StatusCode::Success {
                    // Connect just (re)negotiated this endpoint's queue
                    // depth (admin vs. the host's requested sqsize); the
                    // tag table must match it going forward.
                    tags = TagTable::new(ep.qsize);
                }

                if response.parked {
                    // Asynchronous Event Request with no event ready yet;
                    // its completion is deferred to take_ready_aen() on a
                    // later idle tick, not sent now.
                    continue;
                }

                if let Err(e) = send_response(&mut writer, &response, ep.cntlid.unwrap_or(0)) {
                    tracing::warn!(error = %e, "failed to send response, closing endpoint");
                    break;
                }
            }
            _ => {
                tracing::debug!(pdu_type = ?hdr.pdu_type, "unexpected PDU type, closing endpoint");
                break;
            }
        }
    }

    if let (Some(h), Some(c)) = (ep.hostnqn.clone(), ep.cntlid) {
        dispatcher.sessions.detach(&h, c);
    }
}

fn handshake<R: std::io::Read, W: std::io::Write>(reader: &mut R, writer: &mut W) -> Result<(), crate::wire::error::WireError> {
    let hdr = PduHeader::read_from(reader)?;
    if hdr.pdu_type != PduType::IcReq {
        return crate::wire::error::UnknownPduType {
            pdu_type: hdr.pdu_type as u8,
        }
        .fail();
    }
    let mut body = vec![0u8; (hdr.plen as usize).saturating_sub(pdu::PDU_HDR_LEN)];
    std::io::Read::read_exact(reader, &mut body)?;
    let params = pdu::IcParams::from_icreq(&body)?;

    let resp_hdr = PduHeader {
        pdu_type: PduType::IcResp,
        flags: pdu::PduFlags::empty(),
        hlen: pdu::PDU_HDR_LEN as u8,
        pdo: 0,
        plen: (pdu::PDU_HDR_LEN + 120) as u32,
    };
    resp_hdr.write_to(writer)?;
    std::io::Write::write_all(writer, &params.to_icresp())?;
    Ok(())
}

fn send_response<W: std::io::Write>(
    writer: &mut W,
    response: &crate::dispatcher::Response,
    command_id: u16,
) -> Result<(), crate::wire::error::WireError> {
    let _ = command_id;
    let cqe_bytes: [u8; CQE_LEN] = response.cqe.encode();

    if response.data.is_empty() {
        return pdu::write_capsule_resp(writer, &cqe_bytes);
    }

    let chunks = pdu::segment_c2h(&response.data, pdu::DEFAULT_MAXH2CDATA);
    let n = chunks.len();
    let mut offset = 0u32;
    for (i, chunk) in chunks.into_iter().enumerate() {
        pdu::write_c2h_data(writer, response.cqe.command_id, offset, chunk, i + 1 == n)?;
        offset += chunk.len() as u32;
    }
    pdu::write_capsule_resp(writer, &cqe_bytes)
}
