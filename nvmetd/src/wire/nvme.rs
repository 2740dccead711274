//! NVMe admin/fabrics SQE and completion layout, grounded on
//! `nvmeadm::nvme_page::NvmeAdminCmd` but trimmed to the fields a
//! discovery controller actually inspects on the ingress path.

pub const SQE_LEN: usize = 64;
pub const CQE_LEN: usize = 16;

pub const OPC_FABRICS: u8 = 0x7f;
pub const OPC_GET_LOG_PAGE: u8 = 0x02;
pub const OPC_IDENTIFY: u8 = 0x06;
pub const OPC_SET_FEATURES: u8 = 0x09;
pub const OPC_KEEP_ALIVE: u8 = 0x18;
pub const OPC_ASYNC_EVENT_REQUEST: u8 = 0x0c;

pub const FCTYPE_PROPERTY_SET: u8 = 0x00;
pub const FCTYPE_CONNECT: u8 = 0x01;
pub const FCTYPE_PROPERTY_GET: u8 = 0x04;

pub const LID_SMART: u8 = 0x02;
pub const LID_DISCOVERY: u8 = 0x70;

pub const FID_NUM_QUEUES: u8 = 0x07;
pub const FID_ASYNC_EVENT: u8 = 0x0b;
pub const FID_KATO: u8 = 0x0f;

pub const CNS_IDENTIFY_CTRL: u8 = 0x01;

/// Status codes returned in bits [14:1] of the completion's `status`
/// field (bit 0 is phase tag, handled by the framer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success = 0x00,
    InvalidOpcode = 0x01,
    InvalidField = 0x02,
    NsNotReady = 0x82,
    BadAttributes = 0x180,
    ConnectInvalidParam = 0x185,
}

/// A parsed 64-byte command SQE, common fields only; fabrics- and
/// admin-opcode-specific dwords are kept raw in `cdw` for the dispatcher
/// to interpret per opcode, mirroring how `cmds.c`'s handlers each read
/// their own `cdw10`..`cdw15` rather than a shared typed union.
#[derive(Debug, Clone)]
pub struct Sqe {
    pub opcode: u8,
    pub fctype: u8,
    pub command_id: u16,
    pub nsid: u32,
    pub cdw: [u32; 6],
}

impl Sqe {
    pub fn parse(buf: &[u8; SQE_LEN]) -> Sqe {
        Sqe {
            opcode: buf[0],
            fctype: buf[4],
            command_id: u16::from_le_bytes([buf[2], buf[3]]),
            nsid: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            cdw: [
                u32::from_le_bytes([buf[40], buf[41], buf[42], buf[43]]),
                u32::from_le_bytes([buf[44], buf[45], buf[46], buf[47]]),
                u32::from_le_bytes([buf[48], buf[49], buf[50], buf[51]]),
                u32::from_le_bytes([buf[52], buf[53], buf[54], buf[55]]),
                u32::from_le_bytes([buf[56], buf[57], buf[58], buf[59]]),
                u32::from_le_bytes([buf[60], buf[61], buf[62], buf[63]]),
            ],
        }
    }
}

/// A 16-byte completion queue entry. `command_id` is copied verbatim from
/// the originating SQE; it is opaque to us and must never be byte-swapped
/// on the way back out.
#[derive(Debug, Clone)]
pub struct Cqe {
    pub result: u32,
    pub command_id: u16,
    pub status: StatusCode,
}

impl Cqe {
    pub fn encode(&self) -> [u8; CQE_LEN] {
        let mut buf = [0u8; CQE_LEN];
        buf[0..4].copy_from_slice(&self.result.to_le_bytes());
        buf[12..14].copy_from_slice(&self.command_id.to_le_bytes());
        let mut status = (self.status as u16) << 1;
        if self.status != StatusCode::Success {
            status |= 1 << 15; // DNR
        }
        buf[14..16].copy_from_slice(&status.to_le_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dnr_set_on_error_status() {
        let cqe = Cqe {
            result: 0,
            command_id: 7,
            status: StatusCode::ConnectInvalidParam,
        };
        let encoded = cqe.encode();
        let status = u16::from_le_bytes([encoded[14], encoded[15]]);
        assert_ne!(status & (1 << 15), 0);
        assert_eq!(u16::from_le_bytes([encoded[12], encoded[13]]), 7);
    }

    #[test]
    fn success_status_has_no_dnr() {
        let cqe = Cqe {
            result: 0,
            command_id: 1,
            status: StatusCode::Success,
        };
        let encoded = cqe.encode();
        let status = u16::from_le_bytes([encoded[14], encoded[15]]);
        assert_eq!(status, 0);
    }
}
