use thiserror::Error;

use crate::config_manager::ConfigError;

type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DepflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any failure of the dependency or queue storage. The original cause is kept.
    #[error("Persistence error while {context}")]
    Persistence {
        context: String,
        #[source]
        source: BoxedCause,
    },

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Propagation exceeded the maximum depth of {depth}")]
    RecursionLimit { depth: usize },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DepflowError {
    pub fn persistence<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Persistence {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Wraps a storage failure unless it already is a persistence or conflict error.
    pub fn into_persistence(self, context: impl Into<String>) -> Self {
        match self {
            err @ (Self::Persistence { .. } | Self::Conflict(_)) => err,
            other => Self::Persistence {
                context: context.into(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Renders the error together with its full source chain.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            out.push_str(": ");
            out.push_str(&err.to_string());
            cause = err.source();
        }
        out
    }
}

pub type Result<T> = std::result::Result<T, DepflowError>;
