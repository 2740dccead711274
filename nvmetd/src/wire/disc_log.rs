//! On-wire layout of the NVMe Discovery Log Page (LID 0x70), grounded on
//! `nvmeadm::nvme_page::{NvmfDiscRspPageHdr, NvmfDiscRspPageEntry}`. Unlike
//! that crate (which overlays a kernel ioctl reply with a `repr(C)` struct
//! and an unsafe zero-size trailing array) we are producing the bytes, not
//! parsing them, so entries are assembled with explicit little-endian
//! writes into an owned buffer rather than a transmuted struct.

pub const HEADER_LEN: usize = 1024;
pub const ENTRY_LEN: usize = 1024;
pub const RECFMT: u16 = 1;

/// Transport type, matches `NVMF_TRTYPE_*` in the NVMe-oF spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrType {
    Rdma = 1,
    Fc = 2,
    Tcp = 3,
    Loop = 254,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFam {
    Ipv4 = 1,
    Ipv6 = 2,
    Ib = 3,
    Fc = 4,
    Loop = 254,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrsReq {
    NotSpecified = 0,
    Required = 1,
    NotRequired = 2,
}

/// Subsystem type advertised in a discovery entry; discovery controllers
/// always report the "discovery referral" subtype rather than NVM.
pub const NVME_NQN_DISC: u8 = 2;

/// One logical `(subsystem, port)` pairing visible to a host.
#[derive(Debug, Clone)]
pub struct DiscEntry {
    pub trtype: TrType,
    pub adrfam: AddrFam,
    pub treq: TrsReq,
    pub portid: u16,
    pub trsvcid: String,
    pub subnqn: String,
    pub traddr: String,
    /// TCP security type byte (`NvmfDiscRspPageEntryTsasTcp::sectype`); the
    /// remaining 255 bytes of `tsas` are not derivable from configfs and
    /// are left zero per the design decision in SPEC_FULL.md §9.
    pub sectype: u8,
}

fn write_ascii_field(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
}

impl DiscEntry {
    pub fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut buf = [0u8; ENTRY_LEN];
        buf[0] = self.trtype as u8;
        buf[1] = self.adrfam as u8;
        buf[2] = NVME_NQN_DISC;
        buf[3] = self.treq as u8;
        buf[4..6].copy_from_slice(&self.portid.to_le_bytes());
        // cntlid: dynamic controller allowed for discovery referrals.
        buf[6..8].copy_from_slice(&0xFFFFu16.to_le_bytes());
        // asqsz left zero (8..10); discovery controllers do not advertise one.
        // resv10 occupies 10..32.
        write_ascii_field(&mut buf[32..64], &self.trsvcid);
        // resv64 occupies 64..256.
        write_ascii_field(&mut buf[256..512], &self.subnqn);
        write_ascii_field(&mut buf[512..768], &self.traddr);
        buf[768] = self.sectype;
        buf
    }
}

/// Builds a full discovery log response, honoring the caller's byte
/// `offset` and `max_len` the same way `discdb_host_disc_entries` streams
/// entries out of the store without materialising the whole page first.
pub fn build_page(genctr: u64, entries: &[DiscEntry], offset: usize, max_len: usize) -> Vec<u8> {
    let mut header = [0u8; HEADER_LEN];
    header[0..8].copy_from_slice(&genctr.to_le_bytes());
    header[8..16].copy_from_slice(&(entries.len() as u64).to_le_bytes());
    header[16..18].copy_from_slice(&RECFMT.to_le_bytes());

    let mut full = Vec::with_capacity(HEADER_LEN + entries.len() * ENTRY_LEN);
    full.extend_from_slice(&header);
    for e in entries {
        full.extend_from_slice(&e.encode());
    }

    let start = offset.min(full.len());
    let end = (start + max_len).min(full.len());
    full[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_page_has_zero_numrec() {
        let page = build_page(0, &[], 0, HEADER_LEN);
        assert_eq!(page.len(), HEADER_LEN);
        assert_eq!(&page[0..8], &0u64.to_le_bytes());
        assert_eq!(&page[8..16], &0u64.to_le_bytes());
        assert_eq!(&page[16..18], &RECFMT.to_le_bytes());
    }

    #[test]
    fn single_entry_round_trip_fields() {
        let e = DiscEntry {
            trtype: TrType::Tcp,
            adrfam: AddrFam::Ipv4,
            treq: TrsReq::NotRequired,
            portid: 1,
            trsvcid: "4420".into(),
            subnqn: "nqn.tgt:sN".into(),
            traddr: "192.0.2.10".into(),
            sectype: 0,
        };
        let page = build_page(2, &[e], 0, HEADER_LEN + ENTRY_LEN);
        assert_eq!(page.len(), HEADER_LEN + ENTRY_LEN);
        let entry = &page[HEADER_LEN..];
        assert_eq!(entry[0], TrType::Tcp as u8);
        assert_eq!(entry[1], AddrFam::Ipv4 as u8);
        assert_eq!(u16::from_le_bytes([entry[4], entry[5]]), 1);
        let trsvcid_end = entry[32..64].iter().position(|&b| b == 0).unwrap_or(32);
        assert_eq!(&entry[32..32 + trsvcid_end], b"4420");
    }

    #[test]
    fn offset_and_max_len_truncate() {
        let page = build_page(1, &[], 10, 20);
        assert_eq!(page.len(), 20);
    }
}
