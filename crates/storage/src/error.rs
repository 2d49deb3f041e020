use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("object store error: {0}")]
    ObjectStore(object_store::Error),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    Unauthorized(String),

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Whether the whole dispatch cycle should stop rather than skip one object.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Unauthorized(_) | SourceError::NotConfigured(_))
    }
}

impl From<object_store::Error> for SourceError {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => SourceError::NotFound(path),
            other => SourceError::ObjectStore(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_not_fatal() {
        let err: SourceError = object_store::Error::NotFound {
            path: "logs/a.log".into(),
            source: "gone".into(),
        }
        .into();
        assert!(matches!(err, SourceError::NotFound(ref p) if p == "logs/a.log"));
        assert!(!err.is_fatal());
        assert!(SourceError::Unauthorized("bucket".into()).is_fatal());
    }
}
