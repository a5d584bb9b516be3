//! Page runtime capability
//!
//! The director never owns the page. It borrows window/document handles,
//! asks the page to reload or evaluate script in its own context, and
//! listens for page-context creation and destruction signals.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::PageResult;
use super::ids::ContextId;

/// Borrowed reference to a page window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowHandle {
    context: ContextId,
    url: String,
}

impl WindowHandle {
    /// Create a handle for the window of `context`
    pub fn new(context: ContextId, url: impl Into<String>) -> Self {
        Self {
            context,
            url: url.into(),
        }
    }

    /// Identity of the page context this window belongs to
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Document URL at the time the handle was taken
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The window's document
    pub fn document(&self) -> DocumentHandle {
        DocumentHandle {
            context: self.context,
            url: self.url.clone(),
        }
    }
}

/// Borrowed reference to the document of a page window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentHandle {
    context: ContextId,
    url: String,
}

impl DocumentHandle {
    /// Identity of the page context this document belongs to
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Document URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Script submitted for evaluation in the page's own context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    /// Source URL reported for the evaluated script
    pub url: String,

    /// Script text
    pub text: String,
}

/// The page (tab) a director is attached to
pub trait PageContext: Send + Sync {
    /// Current top-level window, if a document is loaded
    fn window(&self) -> Option<WindowHandle>;

    /// Reload the current document
    fn reload(&self) -> PageResult<()>;

    /// Evaluate script in the page's own context (not a sandbox)
    fn evaluate(&self, request: EvaluationRequest) -> PageResult<Value>;
}

/// Registration token handed out by a [`NavigationSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Receiver of raw page-context signals
///
/// Signals cover every context of the process (frames, other tabs); callers
/// filter them.
pub trait NavigationListener: Send + Sync {
    /// A new page context (window global) was created
    fn context_created(&self, window: &WindowHandle);

    /// The page context with this identity was destroyed
    fn context_destroyed(&self, context: ContextId);
}

/// Source of page-context creation/destruction signals
///
/// Implementations must not hold internal locks while invoking listeners:
/// a listener may subscribe or unsubscribe from inside the callback.
pub trait NavigationSource: Send + Sync {
    /// Register a listener
    fn subscribe(&self, listener: std::sync::Arc<dyn NavigationListener>) -> ListenerId;

    /// Remove a listener; unknown ids are ignored
    fn unsubscribe(&self, listener: ListenerId);
}
