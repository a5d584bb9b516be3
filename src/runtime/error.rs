//! Error types for the director runtime
//!
//! Domain errors use thiserror; the service maps them to wire codes at the
//! protocol boundary.

use thiserror::Error;

/// Errors raised by a sandbox realm or by host capabilities bound into it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    /// `target.evaluate` called without source text
    #[error("source is empty")]
    EmptySource,

    /// The instrumenter source failed to evaluate
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// Sandboxed code threw while running
    #[error("sandboxed code threw: {0}")]
    Thrown(String),

    /// The realm (or a capability bound into it) was already released
    #[error("realm has been destroyed")]
    RealmDestroyed,

    /// A binding could not be installed or removed
    #[error("cannot bind '{path}': {detail}")]
    Binding {
        /// Dotted path inside the realm
        path: String,
        /// Failure description
        detail: String,
    },

    /// The export exists but is a plain value
    #[error("export '{0}' is not callable")]
    NotCallable(String),
}

/// Convenience result alias for sandbox operations
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Errors raised by the page runtime
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    /// The page currently has no window to bind to
    #[error("page has no current window")]
    NoWindow,

    /// Reload could not be triggered
    #[error("reload failed: {0}")]
    Reload(String),

    /// Evaluation in the page's own context failed
    #[error("page evaluation failed: {0}")]
    Evaluation(String),
}

/// Convenience result alias for page operations
pub type PageResult<T> = std::result::Result<T, PageError>;

/// Instrumenter actor errors
#[derive(Debug, Error)]
pub enum InstrumenterError {
    /// `activate` on an instrumenter that already owns a sandbox
    #[error("instrumenter '{0}' is already active")]
    AlreadyActive(String),

    /// Call that needs a sandbox on an inactive instrumenter
    #[error("instrumenter '{0}' is not active")]
    NotActive(String),

    /// Call on an instrumenter that has been finalized
    #[error("instrumenter '{0}' has been destroyed")]
    Destroyed(String),

    /// `callMethod` on a missing export under the error policy
    #[error("instrumenter '{id}' exports no method '{method}'")]
    MethodNotFound {
        /// Instrumenter id
        id: String,
        /// Requested export name
        method: String,
    },

    /// Sandboxed method threw during `callMethod`
    #[error("method '{method}' of instrumenter '{id}' failed: {detail}")]
    SandboxInvocation {
        /// Instrumenter id
        id: String,
        /// Invoked export name
        method: String,
        /// Error reported by the sandbox
        detail: String,
    },

    /// Sandbox creation or evaluation failed
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// Page runtime failure (reload, missing window)
    #[error("page error: {0}")]
    Page(#[from] PageError),
}

/// Convenience result alias for instrumenter operations
pub type InstrumenterResult<T> = std::result::Result<T, InstrumenterError>;

/// Director actor errors
#[derive(Debug, Error)]
pub enum DirectorError {
    /// No instrumenter registered under this id
    #[error("instrumenter not found: {0}")]
    NotFound(String),

    /// Id already registered and the policy rejects duplicates
    #[error("instrumenter id already installed: {0}")]
    DuplicateId(String),

    /// Configured instrumenter cap reached
    #[error("instrumenter limit of {0} reached")]
    LimitReached(usize),

    /// The director has been finalized and no longer accepts requests
    #[error("director is detached from its page")]
    Detached,

    /// Failure forwarded from an instrumenter
    #[error("{0}")]
    Instrumenter(#[from] InstrumenterError),
}

/// Convenience result alias for director operations
pub type DirectorResult<T> = std::result::Result<T, DirectorError>;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value outside its domain
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Convenience result alias for configuration checks
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
