//! Admin/fabrics opcode router, grounded on `cmds.c`'s `handle_request`
//! and its per-opcode handlers (`handle_connect`, `handle_property_set`,
//! `handle_property_get`, `handle_identify_ctrl`, `handle_get_log_page`,
//! `handle_set_features`, keep-alive). Each handler here returns the
//! completion plus an optional data payload, leaving PDU framing (how
//! the payload is split across C2HData PDUs) to the caller.

use std::sync::Arc;

use crate::config::{Config, Protocol};
use crate::session::SessionTable;
use crate::store::Store;
use crate::wire::nvme::{self, Cqe, Sqe, StatusCode};

pub const AEN_BIT_DISC_CHANGE: u32 = 1 << 2;

/// Per-endpoint connection state the dispatcher consults and mutates.
pub struct EndpointCtx {
    pub qid: u16,
    pub qsize: u16,
    pub hostnqn: Option<String>,
    pub cntlid: Option<u16>,
}

pub struct Dispatcher {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub sessions: Arc<SessionTable>,
}

pub struct Response {
    pub cqe: Cqe,
    pub data: Vec<u8>,
    /// `true` for a parked Asynchronous Event Request: the caller must
    /// not send a completion now, only remember the command id so
    /// `take_ready_aen` can complete it once an event arrives.
    pub parked: bool,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, store: Arc<Store>, sessions: Arc<SessionTable>) -> Dispatcher {
        Dispatcher {
            config,
            store,
            sessions,
        }
    }

    pub fn dispatch(&self, ep: &mut EndpointCtx, sqe: &Sqe, icd: &[u8]) -> Response {
        // Connect is the one command that is always allowed through,
        // since it's how a qid>0 endpoint attaches to a session in the
        // first place; every other opcode is rejected off the admin
        // queue (SPEC_FULL.md §4.G: "qid>0 any op -> INVALID_OPCODE").
        if sqe.opcode == nvme::OPC_FABRICS {
            return self.dispatch_fabrics(ep, sqe, icd);
        }
        if ep.qid > 0 {
            return self.status(sqe, StatusCode::InvalidOpcode);
        }
        if ep.hostnqn.is_none() {
            return self.status(sqe, StatusCode::ConnectInvalidParam);
        }

        match sqe.opcode {
            nvme::OPC_IDENTIFY => self.identify(ep, sqe),
            nvme::OPC_GET_LOG_PAGE => self.get_log_page(ep, sqe),
            nvme::OPC_SET_FEATURES => self.set_features(ep, sqe),
            nvme::OPC_KEEP_ALIVE => self.keep_alive(ep, sqe),
            nvme::OPC_ASYNC_EVENT_REQUEST => self.async_event_request(ep, sqe),
            _ => self.status(sqe, StatusCode::InvalidOpcode),
        }
    }

    fn status(&self, sqe: &Sqe, status: StatusCode) -> Response {
        Response {
            cqe: Cqe {
                result: 0,
                command_id: sqe.command_id,
                status,
            },
            data: vec![],
            parked: false,
        }
    }

    fn dispatch_fabrics(&self, ep: &mut EndpointCtx, sqe: &Sqe, icd: &[u8]) -> Response {
        match sqe.fctype {
            nvme::FCTYPE_CONNECT => self.connect(ep, sqe, icd),
            nvme::FCTYPE_PROPERTY_SET => self.property_set(ep, sqe),
            nvme::FCTYPE_PROPERTY_GET => self.property_get(ep, sqe),
            _ => self.status(sqe, StatusCode::InvalidField),
        }
    }

    /// `icd` is the fabrics Connect data, a 1024-byte `nvmf_connect_data`
    /// (`hostid[16]`, `cntlid` at 16, `subnqn` at 256, `hostnqn` at 512).
    /// The queue this Connect targets and its queue size travel in the
    /// SQE itself: `cdw10` bits `[31:16]` carry `qid`, `cdw11` bits
    /// `[15:0]` carry `sqsize` (0's-based).
    fn connect(&self, ep: &mut EndpointCtx, sqe: &Sqe, icd: &[u8]) -> Response {
        let qid = ((sqe.cdw[0] >> 16) & 0xffff) as u16;
        let sqsize = (sqe.cdw[1] & 0xffff) as u16;
        let requested_cntlid = icd
            .get(16..18)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .unwrap_or(0xFFFF);
        let hostnqn = match parse_cstr(icd, 512, Protocol::MAX_NQN_SIZE) {
            Some(h) => h,
            None => return self.status(sqe, StatusCode::ConnectInvalidParam),
        };

        ep.qid = qid;
        ep.qsize = if qid == 0 {
            Protocol::NVMF_DQ_DEPTH
        } else {
            sqsize.saturating_add(1).max(1)
        };

        if qid == 0 {
            if requested_cntlid != 0xFFFF {
                return self.status(sqe, StatusCode::ConnectInvalidParam);
            }
            let cntlid = self.sessions.create(&hostnqn, Protocol::NVMF_NUM_QUEUES);
            ep.hostnqn = Some(hostnqn);
            ep.cntlid = Some(cntlid);
            Response {
                cqe: Cqe {
                    result: cntlid as u32,
                    command_id: sqe.command_id,
                    status: StatusCode::Success,
                },
                data: vec![],
                parked: false,
            }
        } else {
            // qid>0 must reference an existing session; 0xFFFF is not a
            // wildcard here (see SPEC_FULL.md §9's resolved open question).
            if requested_cntlid == 0xFFFF || !self.sessions.attach(&hostnqn, requested_cntlid) {
                return self.status(sqe, StatusCode::ConnectInvalidParam);
            }
            ep.hostnqn = Some(hostnqn);
            ep.cntlid = Some(requested_cntlid);
            Response {
                cqe: Cqe {
                    result: requested_cntlid as u32,
                    command_id: sqe.command_id,
                    status: StatusCode::Success,
                },
                data: vec![],
                parked: false,
            }
        }
    }

    fn property_set(&self, ep: &mut EndpointCtx, sqe: &Sqe) -> Response {
        let offset = sqe.cdw[0] & 0xff;
        let value = sqe.cdw[2];
        if offset == 0x14 {
            // CC
            if let (Some(h), Some(c)) = (&ep.hostnqn, ep.cntlid) {
                self.sessions.with_session(h, c, |s| s.state.write_cc(value));
            }
        }
        self.status(sqe, StatusCode::Success)
    }

    fn property_get(&self, ep: &mut EndpointCtx, sqe: &Sqe) -> Response {
        let offset = sqe.cdw[0] & 0xff;
        let result = match offset {
            0x00 => Protocol::CAP as u32,
            0x08 => Protocol::VS,
            0x14 => {
                if let (Some(h), Some(c)) = (&ep.hostnqn, ep.cntlid) {
                    self.sessions.with_session(h, c, |s| s.state.cc).unwrap_or(0)
                } else {
                    0
                }
            }
            0x1c => {
                if let (Some(h), Some(c)) = (&ep.hostnqn, ep.cntlid) {
                    self.sessions.with_session(h, c, |s| s.state.csts).unwrap_or(0)
                } else {
                    0
                }
            }
            _ => 0,
        };
        Response {
            cqe: Cqe {
                result,
                command_id: sqe.command_id,
                status: StatusCode::Success,
            },
            data: vec![],
            parked: false,
        }
    }

    fn identify(&self, ep: &mut EndpointCtx, sqe: &Sqe) -> Response {
        let cns = (sqe.cdw[0] & 0xff) as u8;
        if cns != nvme::CNS_IDENTIFY_CTRL {
            return self.status(sqe, StatusCode::BadAttributes);
        }
        let cntlid = ep.cntlid.unwrap_or(0);
        let mut data = vec![0u8; 4096];
        data[76] = 3; // cmic
        data[78..80].copy_from_slice(&cntlid.to_le_bytes());
        data[80..84].copy_from_slice(&0x0001_0400u32.to_le_bytes()); // ver, NVMe 1.4.0
        data[536..540].copy_from_slice(&0x0010_0005u32.to_le_bytes()); // sgls
        let kas = (Protocol::KATO_INTERVAL_MS / 100) as u16;
        data[320..322].copy_from_slice(&kas.to_le_bytes());
        data[768..1024].copy_from_slice(&pad_ascii(&self.config.discovery_nqn, 256));
        data[514..516].copy_from_slice(&ep.qsize.to_le_bytes()); // maxcmd
        data[261] = 0x01; // lpa.ext_data
        data[111] = 0x02; // cntrltype = Discovery
        self.ok(sqe, data)
    }

    fn get_log_page(&self, ep: &mut EndpointCtx, sqe: &Sqe) -> Response {
        let lid = (sqe.cdw[0] & 0xff) as u8;
        let numdl = (sqe.cdw[0] >> 16) & 0xffff;
        let numdu = (sqe.cdw[1]) & 0xffff;
        let len = (((numdu << 16) | numdl) as usize + 1) * 4;
        let offset = ((sqe.cdw[2] as u64) | ((sqe.cdw[3] as u64) << 32)) as usize;

        match lid {
            nvme::LID_DISCOVERY => {
                let hostnqn = match &ep.hostnqn {
                    Some(h) => h.clone(),
                    None => return self.status(sqe, StatusCode::InvalidField),
                };
                match self.store.host_disc_entries(&hostnqn, offset, len) {
                    Ok(data) => self.ok(sqe, data),
                    Err(_) => self.status(sqe, StatusCode::InvalidField),
                }
            }
            nvme::LID_SMART => self.ok(sqe, vec![0u8; len]),
            _ => self.status(sqe, StatusCode::InvalidField),
        }
    }

    fn set_features(&self, ep: &mut EndpointCtx, sqe: &Sqe) -> Response {
        let fid = (sqe.cdw[0] & 0xff) as u8;
        match fid {
            nvme::FID_NUM_QUEUES => {
                let requested_sq = (sqe.cdw[1] & 0xffff) as u16;
                let requested_cq = ((sqe.cdw[1] >> 16) & 0xffff) as u16;
                let negotiated = requested_sq.min(requested_cq).min(ep.qsize).max(1);
                if let (Some(h), Some(c)) = (&ep.hostnqn, ep.cntlid) {
                    self.sessions
                        .with_session(h, c, |s| s.max_endpoints = negotiated);
                }
                Response {
                    cqe: Cqe {
                        result: ((negotiated as u32) << 16) | negotiated as u32,
                        command_id: sqe.command_id,
                        status: StatusCode::Success,
                    },
                    data: vec![],
                    parked: false,
                }
            }
            nvme::FID_ASYNC_EVENT => {
                if let (Some(h), Some(c)) = (&ep.hostnqn, ep.cntlid) {
                    self.sessions.with_session(h, c, |s| s.aen_mask = sqe.cdw[1]);
                }
                self.status(sqe, StatusCode::Success)
            }
            nvme::FID_KATO => {
                let kato_ms = sqe.cdw[1];
                let ticks = (kato_ms as u64 / Protocol::KATO_INTERVAL_MS).max(1) as u32;
                if let (Some(h), Some(c)) = (&ep.hostnqn, ep.cntlid) {
                    self.sessions.with_session(h, c, |s| {
                        s.kato_base = ticks;
                        s.kato_ticks = ticks;
                    });
                }
                self.status(sqe, StatusCode::Success)
            }
            _ => self.status(sqe, StatusCode::InvalidField),
        }
    }

    fn keep_alive(&self, ep: &mut EndpointCtx, sqe: &Sqe) -> Response {
        if let (Some(h), Some(c)) = (&ep.hostnqn, ep.cntlid) {
            self.sessions.with_session(h, c, |s| s.kato_ticks = s.kato_base);
        }
        self.status(sqe, StatusCode::Success)
    }

    /// Parks the request against the session unless an event is already
    /// queued, in which case it completes immediately with the event
    /// bits in the result field.
    fn async_event_request(&self, ep: &mut EndpointCtx, sqe: &Sqe) -> Response {
        let (h, c) = match (&ep.hostnqn, ep.cntlid) {
            (Some(h), Some(c)) => (h.clone(), c),
            _ => return self.status(sqe, StatusCode::InvalidField),
        };
        match self.sessions.park_aer(&h, c, sqe.command_id) {
            Some(events) => Response {
                cqe: Cqe {
                    result: events,
                    command_id: sqe.command_id,
                    status: StatusCode::Success,
                },
                data: vec![],
                parked: false,
            },
            None => Response {
                cqe: Cqe {
                    result: 0,
                    command_id: sqe.command_id,
                    status: StatusCode::Success,
                },
                data: vec![],
                parked: true,
            },
        }
    }

    fn ok(&self, sqe: &Sqe, data: Vec<u8>) -> Response {
        Response {
            cqe: Cqe {
                result: 0,
                command_id: sqe.command_id,
                status: StatusCode::Success,
            },
            data,
            parked: false,
        }
    }
}

fn parse_cstr(buf: &[u8], offset: usize, max_len: usize) -> Option<String> {
    let end = (offset + max_len).min(buf.len());
    if offset >= end {
        return None;
    }
    let slice = &buf[offset..end];
    let nul = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    let s = std::str::from_utf8(&slice[..nul]).ok()?.to_string();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn pad_ascii(s: &str, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DISCOVERY_NQN;

    fn fixture() -> Dispatcher {
        let config = Arc::new(Config {
            configfs_root: "/tmp".into(),
            listen_port: 8009,
            discovery_nqn: DEFAULT_DISCOVERY_NQN.into(),
            db_path: "/tmp/test.sqlite".into(),
            tls: false,
            verbosity: 0,
        });
        let store = Arc::new(Store::open_in_memory().unwrap());
        let sessions = Arc::new(SessionTable::new());
        Dispatcher::new(config, store, sessions)
    }

    fn connect_icd(hostnqn: &str, cntlid: u16) -> Vec<u8> {
        let mut icd = vec![0u8; 1024];
        icd[16..18].copy_from_slice(&cntlid.to_le_bytes());
        let bytes = hostnqn.as_bytes();
        icd[512..512 + bytes.len()].copy_from_slice(bytes);
        icd
    }

    fn connect_sqe(qid: u16, sqsize: u16) -> Sqe {
        Sqe {
            opcode: nvme::OPC_FABRICS,
            fctype: nvme::FCTYPE_CONNECT,
            command_id: 1,
            nsid: 0,
            cdw: [(qid as u32) << 16, sqsize as u32, 0, 0, 0, 0],
        }
    }

    #[test]
    fn connect_qid0_then_qid1_attach() {
        let d = fixture();
        let mut ep0 = EndpointCtx {
            qid: 0,
            qsize: 2,
            hostnqn: None,
            cntlid: None,
        };
        let sqe = connect_sqe(0, 0);
        let icd = connect_icd("nqn.example:host:A", 0xFFFF);
        let resp = d.dispatch(&mut ep0, &sqe, &icd);
        assert_eq!(resp.cqe.status, StatusCode::Success);
        let cntlid = resp.cqe.result as u16;

        let mut ep1 = EndpointCtx {
            qid: 1,
            qsize: 32,
            hostnqn: None,
            cntlid: None,
        };
        let sqe1 = connect_sqe(1, 31);
        let icd1 = connect_icd("nqn.example:host:A", cntlid);
        let resp1 = d.dispatch(&mut ep1, &sqe1, &icd1);
        assert_eq!(resp1.cqe.status, StatusCode::Success);
        assert_eq!(ep1.qsize, 32);
    }

    #[test]
    fn connect_qid1_unknown_cntlid_rejected() {
        let d = fixture();
        let mut ep1 = EndpointCtx {
            qid: 1,
            qsize: 32,
            hostnqn: None,
            cntlid: None,
        };
        let sqe = connect_sqe(1, 31);
        let icd = connect_icd("nqn.example:host:A", 99);
        let resp = d.dispatch(&mut ep1, &sqe, &icd);
        assert_eq!(resp.cqe.status, StatusCode::ConnectInvalidParam);
    }
}
