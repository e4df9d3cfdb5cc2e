use std::io;

/// Crate-wide error type. Mirrors the flat enum-plus-`From` shape used by the
/// networking layer this crate is descended from, but leans on `thiserror` for
/// the `Display`/`std::error::Error` boilerplate instead of hand writing it.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("truncated data: expected {needed} more byte(s), {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("{0} trailing byte(s) after the last record")]
    TrailingGarbage(usize),

    #[error("unknown value type code {0}")]
    UnknownValueType(u8),

    #[error("record referenced unknown node id {0}")]
    DanglingReference(u32),

    #[error("connection refused by host")]
    Refused,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("missing required field {0:?} on node")]
    MissingField(String),

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that should tear the connection down rather than just
    /// failing the call that triggered them.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Error::Truncated { .. }
                | Error::TrailingGarbage(_)
                | Error::UnknownValueType(_)
                | Error::DanglingReference(_)
                | Error::TransportError(_)
                | Error::Io(_)
        )
    }
}
