use std::path::PathBuf;

/// Well-known Discovery NQN, used both as the default value for `--nqn`
/// and as the always-present host row that `allow_any_host` subsystems
/// link against (see the reflector's synthetic-link rule).
pub const DEFAULT_DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// Protocol-fixed constants, translated from `common.h`'s `#define`s into
/// named constants rather than carried as preprocessor macros.
pub struct Protocol;

impl Protocol {
    pub const KATO_INTERVAL_MS: u64 = 1000;
    pub const RETRY_COUNT: u32 = 120;
    pub const NVMF_DQ_DEPTH: u16 = 2;
    pub const NVMF_SQ_DEPTH: u16 = 128;
    pub const NVMF_NUM_QUEUES: u16 = 8;
    pub const MAX_NQN_SIZE: usize = 256;
    pub const CAP: u64 = 0x200f_0003_ff;
    pub const VS: u32 = 0x0001_0400;
}

/// Resolved runtime configuration, built once from CLI arguments and handed
/// out as `Arc<Config>` to every long-lived thread.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the configfs tree we watch, e.g. `/sys/kernel/config/nvmet`.
    pub configfs_root: PathBuf,
    /// TCP port the discovery listener(s) bind to.
    pub listen_port: u16,
    /// This controller's own subsystem NQN.
    pub discovery_nqn: String,
    /// Path to the persisted discovery database file.
    pub db_path: PathBuf,
    /// Whether TLS/PSK negotiation was requested (negotiation itself is out
    /// of scope; this only gates advertising the capability).
    pub tls: bool,
    /// 0 = warn/error, 1 = + command log, 2 = + PDU log, 3 = + inotify log.
    pub verbosity: u8,
}

impl Config {
    pub fn tracing_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
