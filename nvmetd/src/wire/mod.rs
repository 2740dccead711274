//! Wire-level NVMe/TCP codec: PDU framing, the admin/fabrics SQE/CQE
//! subset the dispatcher needs, and the Discovery Log Page layout.

pub mod disc_log;
pub mod error;
pub mod nvme;
pub mod pdu;

pub use error::WireError;
