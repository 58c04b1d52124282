use thiserror::Error;

use crate::db::StructuredError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures a query request can end with.
///
/// Every variant is recovered at the request boundary: the node releases what
/// it holds, emits one error-shaped message and stays available.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Named placeholders referenced by the SQL but absent from the parameters.
    #[error("Missing Parameters: {}", .0.join(", "))]
    MissingParameters(Vec<String>),

    /// Pool construction, pool checkout or standalone connect failed.
    #[error("Connection failure: {0}")]
    Connection(String),

    /// The server rejected or failed a single round-trip query.
    #[error("{0}")]
    Query(StructuredError),

    /// Opening the cursor or fetching a page failed mid-stream.
    #[error("{0}")]
    Cursor(StructuredError),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn connection(err: impl std::fmt::Display) -> Self {
        Error::Connection(err.to_string())
    }

    pub fn config(err: impl std::fmt::Display) -> Self {
        Error::Config(err.to_string())
    }

    /// Short label used in logs and status text.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MissingParameters(_) => "missing_parameters",
            Error::Connection(_) => "connection",
            Error::Query(_) => "query",
            Error::Cursor(_) => "cursor",
            Error::Template(_) => "template",
            Error::Config(_) => "config",
        }
    }
}
