use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum StoreError {
    #[snafu(display("sqlite error: {}", source))]
    Sqlite { source: rusqlite::Error },
    #[snafu(display("{} {} not found", kind, id))]
    NotFound { kind: &'static str, id: String },
    #[snafu(display("{} {} already exists", kind, id))]
    Duplicate { kind: &'static str, id: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(source: rusqlite::Error) -> StoreError {
        match &source {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Duplicate {
                    kind: "row",
                    id: source.to_string(),
                }
            }
            _ => StoreError::Sqlite {
                source,
            },
        }
    }
}
