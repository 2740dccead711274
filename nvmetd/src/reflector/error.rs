use snafu::Snafu;

/// Errors raised while translating configfs events into store mutations.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum ReflectorError {
    #[snafu(display("IO error on {}: {}", path, source))]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("inotify error: {}", source))]
    Inotify { source: nix::Error },
    #[snafu(display("store error: {}", source))]
    Store { source: crate::store::StoreError },
    #[snafu(display("malformed attribute {}: {}", path, contents))]
    BadAttribute { path: String, contents: String },
}

impl From<crate::store::StoreError> for ReflectorError {
    fn from(source: crate::store::StoreError) -> ReflectorError {
        ReflectorError::Store {
            source,
        }
    }
}
