use thiserror::Error;

/// Errors raised by the local store.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("No catalogue found with name or UUID {0}")]
    CatalogueNotFound(String),

    #[error("No event found with UUID {0}")]
    EventNotFound(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Attribute {0} is not a finite number")]
    InvalidAttribute(String),

    /// The delta could not be decoded or applied by the replicated document.
    #[error("Cannot merge delta: {0}")]
    Merge(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the VOTable codec.
#[derive(Debug, Error)]
pub enum VoTableError {
    /// The catalogue cannot be represented as a single table.
    #[error("Export VOTable: {0}")]
    Validation(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Import VOTable: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl DbError {
    /// Whether this is a failed lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::CatalogueNotFound(_) | DbError::EventNotFound(_))
    }
}
