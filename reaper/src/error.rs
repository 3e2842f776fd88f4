//! Reaper error types.

use std::fmt;

use thiserror::Error;

use crate::inventory::ObjectKind;

/// Errors that can occur during a cleanup pass.
#[derive(Debug, Error)]
pub enum ReapError {
    /// Caller passed an empty or otherwise unusable input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Container pruning was requested for a kind that cannot be pruned.
    #[error("pruning children is not implemented for object type {0}")]
    Unsupported(ObjectKind),

    /// Object or resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// An inventory path resolved to more than one object.
    #[error("expected to find exactly 1 object at {path}, found {count}")]
    Ambiguous { path: String, count: usize },

    /// A VM came back from the property fetch without runtime properties.
    #[error("missing runtime properties for VM {0}")]
    MissingProperties(String),

    /// A deletion marker holds something other than an RFC 3339 timestamp.
    #[error("invalid deletion marker on {path}: {value:?}")]
    InvalidMarker { path: String, value: String },

    /// The platform rejected or failed a request.
    #[error("remote: {0}")]
    Remote(String),

    /// Transport-level HTTP failure.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// The lease broker failed.
    #[error("lease broker: {0}")]
    Lease(#[from] reaper_lease::LeaseError),

    /// An asynchronous platform task finished in error.
    #[error("task {task} for {target} failed: {message}")]
    TaskFailed {
        task: String,
        target: String,
        message: String,
    },

    /// The pass was cancelled while waiting.
    #[error("cancelled")]
    Cancelled,

    /// An error wrapped with a description of what was being done.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ReapError>,
    },

    /// Several independent failures.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl ReapError {
    /// Wrap this error with a description of the failed step.
    pub fn context(self, context: impl Into<String>) -> Self {
        ReapError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True if this error, or any error it wraps, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ReapError::Cancelled => true,
            ReapError::Context { source, .. } => source.is_cancelled(),
            ReapError::Aggregate(agg) => agg.errors().iter().any(ReapError::is_cancelled),
            _ => false,
        }
    }
}

/// Extension for attaching context to results.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

/// A flat list of errors collected across independent items.
#[derive(Debug)]
pub struct AggregateError {
    errors: Vec<ReapError>,
}

impl AggregateError {
    /// Build an aggregate, or `None` if there is nothing to report.
    ///
    /// Nested aggregates are flattened so the message lists every leaf
    /// failure once.
    pub fn new(errors: Vec<ReapError>) -> Option<Self> {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                ReapError::Aggregate(inner) => flat.extend(inner.errors),
                other => flat.push(other),
            }
        }
        if flat.is_empty() {
            None
        } else {
            Some(Self { errors: flat })
        }
    }

    pub fn errors(&self) -> &[ReapError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [only] = self.errors.as_slice() {
            return write!(f, "{}", only);
        }
        write!(f, "[")?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", err)?;
        }
        write!(f, "]")
    }
}

impl std::error::Error for AggregateError {}

/// Turn a list of collected errors into a single result.
pub fn aggregate(errors: Vec<ReapError>) -> Result<()> {
    match AggregateError::new(errors) {
        Some(agg) => Err(ReapError::Aggregate(agg)),
        None => Ok(()),
    }
}

/// Result type for reaper operations.
pub type Result<T> = std::result::Result<T, ReapError>;
