//! Error types for roomshard

use std::fmt;

/// Result type alias for roomshard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for roomshard
#[derive(Debug)]
pub enum Error {
    /// Location is not part of the configured topology
    UnknownLocation(String),
    /// Series key does not follow `sensor:{type}:{location}:{id}`
    MalformedKey(String),
    /// No configured sensor type reports in this unit of measure
    UnknownUnit(String),
    /// Shard endpoint could not be reached or failed its liveness probe
    ShardUnreachable { location: String, reason: String },
    /// Endpoint answered but is a read-only replica
    ShardReadOnly { location: String, addr: String },
    /// Location is configured but has no live connection
    LocationUnavailable(String),
    /// Series does not exist on the shard
    SeriesNotFound(String),
    /// Series already exists (create raced with another writer)
    SeriesExists(String),
    /// Write failed after the reconnect-and-retry attempt
    WriteFailed { key: String, cause: Box<Error> },
    /// Network call exceeded its deadline
    QueryTimeout,
    /// Long-term sink rejected or failed a batch
    SinkWriteFailed(String),
    /// Primary discovery failed
    Discovery(String),
    /// Wire protocol violation or engine error reply
    Protocol(String),
    /// Configuration errors
    Config(String),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// HTTP client errors
    Http(reqwest::Error),
    /// Internal error
    Internal(String),
}

impl Error {
    /// Whether the error indicates a broken or stale connection, i.e. one that a
    /// reconnect (possibly to a newly elected primary) may fix.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::ShardUnreachable { .. }
            | Error::ShardReadOnly { .. }
            | Error::QueryTimeout
            | Error::Io(_) => true,
            // Redis answers writes on a demoted primary with READONLY
            Error::Protocol(msg) => msg.starts_with("READONLY") || msg.contains("connection"),
            _ => false,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Http(e) => Some(e),
            Error::WriteFailed { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownLocation(loc) => write!(f, "Unknown location: {}", loc),
            Error::MalformedKey(key) => write!(f, "Malformed series key: {}", key),
            Error::UnknownUnit(unit) => write!(f, "No sensor type measured in '{}'", unit),
            Error::ShardUnreachable { location, reason } => {
                write!(f, "Shard {} unreachable: {}", location, reason)
            }
            Error::ShardReadOnly { location, addr } => {
                write!(f, "Shard {} at {} is a read-only replica", location, addr)
            }
            Error::LocationUnavailable(loc) => {
                write!(f, "No live connection for location: {}", loc)
            }
            Error::SeriesNotFound(key) => write!(f, "Series not found: {}", key),
            Error::SeriesExists(key) => write!(f, "Series already exists: {}", key),
            Error::WriteFailed { key, cause } => write!(f, "Write to {} failed: {}", key, cause),
            Error::QueryTimeout => write!(f, "Operation timed out"),
            Error::SinkWriteFailed(msg) => write!(f, "Archive sink write failed: {}", msg),
            Error::Discovery(msg) => write!(f, "Primary discovery error: {}", msg),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Http(e) => write!(f, "HTTP error: {}", e),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::QueryTimeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_classification() {
        assert!(Error::QueryTimeout.is_connection_error());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .is_connection_error());
        assert!(Error::Protocol("READONLY You can't write against a read only replica.".into())
            .is_connection_error());
        assert!(!Error::SeriesNotFound("sensor:temperature:salon:1".into()).is_connection_error());
        assert!(!Error::UnknownLocation("garage".into()).is_connection_error());
    }

    #[test]
    fn test_write_failed_exposes_cause() {
        let err = Error::WriteFailed {
            key: "sensor:humidity:salon:2".into(),
            cause: Box::new(Error::QueryTimeout),
        };
        assert!(format!("{err}").contains("sensor:humidity:salon:2"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
