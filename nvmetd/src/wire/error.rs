use snafu::Snafu;

/// Errors arising from decoding or encoding NVMe/TCP PDUs.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum WireError {
    #[snafu(display("short read: expected {} bytes, got {}", expected, got))]
    ShortRead { expected: usize, got: usize },
    #[snafu(display("unknown PDU type {:#x}", pdu_type))]
    UnknownPduType { pdu_type: u8 },
    #[snafu(display("PDU header digest mismatch"))]
    HeaderDigest,
    #[snafu(display("PDU data digest mismatch"))]
    DataDigest,
    #[snafu(display("unsupported ICReq feature bits {:#x}", bits))]
    UnsupportedIcreq { bits: u16 },
    #[snafu(display("connection closed by peer"))]
    ConnectionClosed,
    #[snafu(display("socket error: {}", source))]
    Io { source: std::io::Error },
}

impl From<std::io::Error> for WireError {
    fn from(source: std::io::Error) -> WireError {
        WireError::Io {
            source,
        }
    }
}
