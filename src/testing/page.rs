//! In-memory page runtime
//!
//! A single tab with an optional top-level document and any number of
//! frames. Navigation mutates the page first and then dispatches the
//! created/destroyed signals synchronously to every listener.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::runtime::error::{PageError, PageResult};
use crate::runtime::ids::ContextId;
use crate::runtime::page::{
    EvaluationRequest, ListenerId, NavigationListener, NavigationSource, PageContext, WindowHandle,
};

type Evaluator = Arc<dyn Fn(&EvaluationRequest) -> PageResult<Value> + Send + Sync>;

struct PageState {
    window: Option<WindowHandle>,
    frames: Vec<WindowHandle>,
}

/// Scriptable page and navigation source
pub struct InMemoryPage {
    state: Mutex<PageState>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn NavigationListener>)>>,
    evaluations: Mutex<Vec<EvaluationRequest>>,
    evaluator: Mutex<Option<Evaluator>>,
    next_context: AtomicU64,
    next_listener: AtomicU64,
    reloads: AtomicUsize,
}

impl InMemoryPage {
    /// A page with no document loaded
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PageState {
                window: None,
                frames: Vec::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            evaluations: Mutex::new(Vec::new()),
            evaluator: Mutex::new(None),
            next_context: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            reloads: AtomicUsize::new(0),
        })
    }

    /// A page whose document already exists (no signal is dispatched)
    pub fn with_document(url: &str) -> Arc<Self> {
        let page = Self::new();
        let window = page.allocate(url);
        page.state.lock().window = Some(window);
        page
    }

    /// Current top-level context
    pub fn current_context(&self) -> Option<ContextId> {
        self.state.lock().window.as_ref().map(WindowHandle::context)
    }

    /// Replace the document: destroy the current context, then create a new one
    pub fn navigate(&self, url: &str) -> ContextId {
        let old = self.state.lock().window.take();
        if let Some(old) = old {
            self.dispatch_destroyed(old.context());
        }

        let window = self.allocate(url);
        self.state.lock().window = Some(window.clone());
        self.dispatch_created(&window);
        window.context()
    }

    /// Replace the document, creating the new context before destroying the old one
    pub fn navigate_overlapped(&self, url: &str) -> ContextId {
        let window = self.allocate(url);
        let old = self.state.lock().window.replace(window.clone());
        self.dispatch_created(&window);

        if let Some(old) = old {
            self.dispatch_destroyed(old.context());
        }
        window.context()
    }

    /// Close the document without loading another
    pub fn close(&self) {
        let old = self.state.lock().window.take();
        if let Some(old) = old {
            self.dispatch_destroyed(old.context());
        }
    }

    /// Create a frame context alongside the top-level document
    pub fn open_frame(&self, url: &str) -> ContextId {
        let frame = self.allocate(url);
        self.state.lock().frames.push(frame.clone());
        self.dispatch_created(&frame);
        frame.context()
    }

    /// Destroy a frame context
    pub fn close_frame(&self, context: ContextId) {
        let removed = {
            let mut state = self.state.lock();
            let before = state.frames.len();
            state.frames.retain(|frame| frame.context() != context);
            before != state.frames.len()
        };
        if removed {
            self.dispatch_destroyed(context);
        }
    }

    /// Deliver a raw "created" signal for an arbitrary window
    pub fn signal_created(&self, window: &WindowHandle) {
        self.dispatch_created(window);
    }

    /// Deliver a raw "destroyed" signal for an arbitrary context
    pub fn signal_destroyed(&self, context: ContextId) {
        self.dispatch_destroyed(context);
    }

    /// Answer page evaluations with `evaluator` instead of echoing the text
    pub fn set_evaluator<F>(&self, evaluator: F)
    where
        F: Fn(&EvaluationRequest) -> PageResult<Value> + Send + Sync + 'static,
    {
        *self.evaluator.lock() = Some(Arc::new(evaluator));
    }

    /// Requests received by `evaluate`
    pub fn evaluations(&self) -> Vec<EvaluationRequest> {
        self.evaluations.lock().clone()
    }

    /// Number of reloads requested
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Number of registered navigation listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn allocate(&self, url: &str) -> WindowHandle {
        let id = self.next_context.fetch_add(1, Ordering::SeqCst);
        WindowHandle::new(ContextId(id), url)
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn NavigationListener>> {
        self.listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    fn dispatch_created(&self, window: &WindowHandle) {
        for listener in self.snapshot_listeners() {
            listener.context_created(window);
        }
    }

    fn dispatch_destroyed(&self, context: ContextId) {
        for listener in self.snapshot_listeners() {
            listener.context_destroyed(context);
        }
    }
}

impl PageContext for InMemoryPage {
    fn window(&self) -> Option<WindowHandle> {
        self.state.lock().window.clone()
    }

    fn reload(&self) -> PageResult<()> {
        let url = self
            .state
            .lock()
            .window
            .as_ref()
            .map(|window| window.url().to_string())
            .ok_or(PageError::NoWindow)?;
        self.reloads.fetch_add(1, Ordering::SeqCst);
        self.navigate(&url);
        Ok(())
    }

    fn evaluate(&self, request: EvaluationRequest) -> PageResult<Value> {
        self.evaluations.lock().push(request.clone());
        let evaluator = self.evaluator.lock().clone();
        match evaluator {
            Some(evaluator) => evaluator(&request),
            None => Ok(json!({ "url": request.url, "text": request.text })),
        }
    }
}

impl NavigationSource for InMemoryPage {
    fn subscribe(&self, listener: Arc<dyn NavigationListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().push((id, listener));
        id
    }

    fn unsubscribe(&self, listener: ListenerId) {
        self.listeners.lock().retain(|(id, _)| *id != listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_replaces_context() {
        let page = InMemoryPage::with_document("https://example.test/");
        let before = page.current_context().unwrap();

        page.reload().unwrap();
        let after = page.current_context().unwrap();

        assert_ne!(before, after);
        assert_eq!(page.reloads(), 1);
        assert_eq!(page.window().unwrap().url(), "https://example.test/");
    }

    #[test]
    fn test_reload_without_document_fails() {
        let page = InMemoryPage::new();
        assert_eq!(page.reload(), Err(PageError::NoWindow));
    }

    #[test]
    fn test_evaluate_records_and_echoes() {
        let page = InMemoryPage::new();
        let result = page
            .evaluate(EvaluationRequest {
                url: "instrumenter@x".into(),
                text: "document.title".into(),
            })
            .unwrap();
        assert_eq!(result["text"], "document.title");
        assert_eq!(page.evaluations().len(), 1);
    }
}
