use thiserror::Error;

#[derive(Error, Debug)]
pub enum PulseError {
    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Commit error: {0}")]
    Commit(String),

    #[error("Association missing: {0}")]
    AssociationMissing(&'static str),

    #[error("Script error: {0}")]
    Script(String),

    #[error("No handler registered for route: {0}")]
    UnknownRoute(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// Translate the redb error family into the taxonomy. The engine draws a
// line between commit rejection and everything else; we keep it.
impl From<redb::DatabaseError> for PulseError {
    fn from(err: redb::DatabaseError) -> Self {
        PulseError::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for PulseError {
    fn from(err: redb::TransactionError) -> Self {
        PulseError::Storage(err.to_string())
    }
}

impl From<redb::TableError> for PulseError {
    fn from(err: redb::TableError) -> Self {
        PulseError::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for PulseError {
    fn from(err: redb::StorageError) -> Self {
        PulseError::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for PulseError {
    fn from(err: redb::CommitError) -> Self {
        PulseError::Commit(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PulseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_error_display() {
        let err = PulseError::Allocation("engine out of memory".into());
        assert_eq!(err.to_string(), "Allocation error: engine out of memory");
    }

    #[test]
    fn test_unknown_route_display() {
        let err = PulseError::UnknownRoute("GET /missing".into());
        assert!(err.to_string().contains("GET /missing"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PulseError = io.into();
        assert!(matches!(err, PulseError::Io(_)));
    }
}
