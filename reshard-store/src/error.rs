#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown table `{0}`")]
    UnknownTable(String),

    #[error("invalid sql identifier `{0}`")]
    InvalidIdentifier(String),

    #[error("connection closed")]
    Closed,

    #[error("foreign key violation `{0}`")]
    ForeignKey(String),

    #[cfg(feature = "mysql")]
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("io `{0}`")]
    Io(#[from] std::io::Error),

    #[error("std::num `{0}`")]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
