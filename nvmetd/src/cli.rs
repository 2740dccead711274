use std::path::PathBuf;
use structopt::StructOpt;

use crate::config::{Config, DEFAULT_DISCOVERY_NQN};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "nvmetd",
    about = "Decentralized NVMe-oF discovery controller"
)]
pub struct NvmetdCliArgs {
    #[structopt(long = "configfs", default_value = "/sys/kernel/config/nvmet")]
    /// Root of the kernel NVMe target configfs tree to watch.
    pub configfs: PathBuf,

    #[structopt(long = "port", default_value = "8009")]
    /// TCP port the discovery listener(s) bind to.
    pub port: u16,

    #[structopt(long = "nqn", default_value = DEFAULT_DISCOVERY_NQN)]
    /// NQN this controller identifies itself with.
    pub nqn: String,

    #[structopt(long = "db", default_value = "nvme_discdb.sqlite")]
    /// Path to the persisted discovery database file.
    pub db: PathBuf,

    #[structopt(long = "tls")]
    /// Request TLS/PSK on accepted connections.
    pub tls: bool,

    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    /// Increase logging verbosity (repeatable, max useful 3 times).
    pub verbose: u8,
}

impl From<NvmetdCliArgs> for Config {
    fn from(args: NvmetdCliArgs) -> Config {
        Config {
            configfs_root: args.configfs,
            listen_port: args.port,
            discovery_nqn: args.nqn,
            db_path: args.db,
            tls: args.tls,
            verbosity: args.verbose,
        }
    }
}
