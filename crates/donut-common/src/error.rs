//! Error types for donut
//!
//! Every fallible operation returns [`Error`]. Lower layers are wrapped
//! with call-site context through [`ResultExt`] without losing the
//! original error, which stays reachable through [`Error::root`] and the
//! standard `source()` chain.

use crate::types::{BucketNameError, ObjectKeyError};
use thiserror::Error;

/// Common result type for donut operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for donut
#[derive(Debug, Error)]
pub enum Error {
    // Construction errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid disks argument: node {node} declares no disks")]
    InvalidDisksArgument { node: String },

    // Namespace errors
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("bucket already exists: {0}")]
    BucketAlreadyExists(String),

    #[error("object not found: {bucket}/{object}")]
    ObjectNotFound { bucket: String, object: String },

    #[error("invalid bucket name: {0}")]
    InvalidBucketName(#[from] BucketNameError),

    #[error("invalid object key: {0}")]
    InvalidObjectKey(#[from] ObjectKeyError),

    #[error("invalid acl: {0}")]
    InvalidAcl(String),

    // Topology errors
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node already exists: {0}")]
    NodeAlreadyExists(String),

    #[error("disk order {order} already occupied on node {node}")]
    DiskOrderOccupied { node: String, order: usize },

    #[error("no disk at order {order} on node {node}")]
    DiskNotFound { node: String, order: usize },

    // Storage errors
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("malformed metadata: {0}")]
    MalformedMetadata(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// A lower-layer error annotated with the operation that hit it
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an object not found error
    pub fn object_not_found(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            bucket: bucket.into(),
            object: object.into(),
        }
    }

    /// Wrap this error with call-site context
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The original error underneath any context frames
    #[must_use]
    pub fn root(&self) -> &Self {
        let mut current = self;
        while let Self::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// Context frames from outermost to innermost
    pub fn frames(&self) -> Vec<&str> {
        let mut frames = Vec::new();
        let mut current = self;
        while let Self::Context { context, source } = current {
            frames.push(context.as_str());
            current = source;
        }
        frames
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Self::BucketNotFound(_)
                | Self::ObjectNotFound { .. }
                | Self::NodeNotFound(_)
                | Self::DiskNotFound { .. }
        )
    }

    /// Check if this is an object not found error
    #[must_use]
    pub fn is_object_not_found(&self) -> bool {
        matches!(self.root(), Self::ObjectNotFound { .. })
    }

    /// Check if a disk reported a missing file or directory
    #[must_use]
    pub fn is_missing_file(&self) -> bool {
        matches!(self.root(), Self::DiskIo(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Attach call-site context to a fallible result
pub trait ResultExt<T> {
    /// Wrap the error with a fixed context message
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Wrap the error with a lazily built context message
    fn with_context<S, F>(self, f: F) -> Result<T>
    where
        S: Into<String>,
        F: FnOnce() -> S;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<S, F>(self, f: F) -> Result<T>
    where
        S: Into<String>,
        F: FnOnce() -> S,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
