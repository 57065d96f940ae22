//! # Error taxonomy
//!
//! A single [`StoreError`] enum covers every failure mode a [`crate::store::Store`]
//! operation can return. Each variant carries the operation name it was raised
//! from (e.g. `"upsert"`, `"search"`) so callers can log or match on both the
//! failure kind and where it happened, without needing to thread context
//! through every call site by hand.
//!
//! Fatal-but-store-stays-usable variants ([`StoreError::NotFound`],
//! [`StoreError::DimensionMismatch`], [`StoreError::InvalidArgument`]) abort
//! only the operation that raised them. [`StoreError::Corrupted`] raised
//! during `init` is fatal to the whole store.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The complete error taxonomy for store operations.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// An operation was attempted after [`crate::store::Store::close`].
    #[error("{op}: store is closed")]
    StoreClosed {
        /// Name of the operation that was attempted.
        op: &'static str,
    },

    /// `GetByID`/`Delete` referenced an id that does not exist.
    #[error("{op}: not found: {id}")]
    NotFound {
        /// Name of the operation that was attempted.
        op: &'static str,
        /// The id that was not found.
        id: String,
    },

    /// A non-upsert insert API was called with an id that already exists.
    #[error("{op}: already exists: {id}")]
    AlreadyExists {
        /// Name of the operation that was attempted.
        op: &'static str,
        /// The id that already exists.
        id: String,
    },

    /// A vector's length is incompatible with the collection's dimension
    /// under the currently configured [`crate::dimension::DimensionPolicy`].
    #[error("{op}: dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Name of the operation that was attempted.
        op: &'static str,
        /// The collection's target dimension.
        expected: usize,
        /// The vector's actual length.
        actual: usize,
    },

    /// Malformed query: negative radius, empty vector, unknown facet
    /// operator, zero TopK, etc.
    #[error("{op}: invalid argument: {message}")]
    InvalidArgument {
        /// Name of the operation that was attempted.
        op: &'static str,
        /// Human-readable description of what was invalid.
        message: String,
    },

    /// A [`crate::cancellation::CancellationToken`] was observed cancelled
    /// at a suspension point.
    #[error("{op}: cancelled")]
    Cancelled {
        /// Name of the operation that was attempted.
        op: &'static str,
    },

    /// A schema or serialized blob failed to decode. Fatal to the store
    /// when raised during `init`.
    #[error("{op}: corrupted: {message}")]
    Corrupted {
        /// Name of the operation that was attempted.
        op: &'static str,
        /// Human-readable description of the corruption.
        message: String,
    },

    /// Engine-level failure: I/O, the relational engine, pool exhaustion.
    #[error("{op}: internal error: {source}")]
    Internal {
        /// Name of the operation that was attempted.
        op: &'static str,
        /// The underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StoreError {
    /// Wrap an arbitrary error as [`StoreError::Internal`], tagging it with
    /// the operation name that produced it.
    pub fn internal<E>(op: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Internal {
            op,
            source: Box::new(source),
        }
    }

    /// Build a [`StoreError::Corrupted`] with a formatted message.
    pub fn corrupted(op: &'static str, message: impl Into<String>) -> Self {
        StoreError::Corrupted {
            op,
            message: message.into(),
        }
    }

    /// Build a [`StoreError::InvalidArgument`] with a formatted message.
    pub fn invalid(op: &'static str, message: impl Into<String>) -> Self {
        StoreError::InvalidArgument {
            op,
            message: message.into(),
        }
    }

    /// The operation name this error was raised from.
    pub fn op(&self) -> &'static str {
        match self {
            StoreError::StoreClosed { op }
            | StoreError::NotFound { op, .. }
            | StoreError::AlreadyExists { op, .. }
            | StoreError::DimensionMismatch { op, .. }
            | StoreError::InvalidArgument { op, .. }
            | StoreError::Cancelled { op }
            | StoreError::Corrupted { op, .. }
            | StoreError::Internal { op, .. } => op,
        }
    }
}

/// Wraps a [`diesel::result::Error`] as [`StoreError::Internal`], unless it
/// is Diesel's `NotFound`, in which case it becomes [`StoreError::NotFound`]
/// with the given id.
pub(crate) fn from_diesel(
    op: &'static str,
    id: impl fmt::Display,
    err: diesel::result::Error,
) -> StoreError {
    match err {
        diesel::result::Error::NotFound => StoreError::NotFound {
            op,
            id: id.to_string(),
        },
        other => StoreError::internal(op, other),
    }
}
