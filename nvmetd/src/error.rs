use snafu::Snafu;

/// Errors returned while bringing the daemon up. All are fatal.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum InitError {
    #[snafu(display("Failed to open discovery database {}: {}", path, source))]
    OpenStore {
        path: String,
        source: crate::store::StoreError,
    },
    #[snafu(display("Failed to initialize inotify: {}", source))]
    Inotify { source: crate::reflector::ReflectorError },
    #[snafu(display("configfs root {} does not exist or is not a directory", path))]
    BadConfigfsRoot { path: String },
    #[snafu(display("Failed to bind {}:{}: {}", addr, port, source))]
    Bind {
        addr: String,
        port: u16,
        source: std::io::Error,
    },
    #[snafu(display("Failed to install signal handler: {}", source))]
    SignalHandler { source: std::io::Error },
}
