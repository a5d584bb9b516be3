//! Navigation watcher
//!
//! Adapts the process-wide page-context signals into two callbacks scoped
//! to the director's page:
//! - "created" only for the page's current top-level window
//! - "destroyed" only for the identity most recently reported as created
//!
//! Observation is held through an owned [`Subscription`]; releasing it (or
//! dropping it) unregisters the listener.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::ids::ContextId;
use super::page::{ListenerId, NavigationListener, NavigationSource, PageContext, WindowHandle};

/// Receiver of filtered navigation callbacks
pub trait NavigationObserver: Send + Sync {
    /// The watched page got a new document
    fn on_context_created(&self, window: WindowHandle);

    /// The watched document went away
    fn on_context_destroyed(&self, context: ContextId);
}

/// Filters navigation signals down to one page
pub struct NavigationWatcher {
    source: Arc<dyn NavigationSource>,
    page: Arc<dyn PageContext>,
    watched: Arc<Mutex<Option<ContextId>>>,
}

impl NavigationWatcher {
    /// Create a watcher for `page` fed by `source`
    pub fn new(source: Arc<dyn NavigationSource>, page: Arc<dyn PageContext>) -> Self {
        Self {
            source,
            page,
            watched: Arc::new(Mutex::new(None)),
        }
    }

    /// Start delivering filtered callbacks to `observer`
    pub fn start(&self, observer: Weak<dyn NavigationObserver>) -> Subscription {
        let listener = Arc::new(FilteringListener {
            page: self.page.clone(),
            watched: self.watched.clone(),
            observer,
        });
        let id = self.source.subscribe(listener);
        tracing::trace!(listener = id.0, "navigation watcher started");
        Subscription {
            source: self.source.clone(),
            listener: Some(id),
        }
    }

    /// Identity whose destruction is currently awaited
    pub fn watched(&self) -> Option<ContextId> {
        *self.watched.lock()
    }

    /// Await destruction of `context` (used when activation binds a context directly)
    pub fn watch(&self, context: ContextId) {
        *self.watched.lock() = Some(context);
    }

    /// Stop awaiting any destruction
    pub fn forget(&self) {
        self.watched.lock().take();
    }
}

/// Owned registration with a navigation source
pub struct Subscription {
    source: Arc<dyn NavigationSource>,
    listener: Option<ListenerId>,
}

impl Subscription {
    /// Listener id assigned by the source
    pub fn id(&self) -> Option<ListenerId> {
        self.listener
    }

    /// Unregister the listener
    pub fn release(mut self) {
        self.unsubscribe();
    }

    fn unsubscribe(&mut self) {
        if let Some(id) = self.listener.take() {
            self.source.unsubscribe(id);
            tracing::trace!(listener = id.0, "navigation watcher stopped");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct FilteringListener {
    page: Arc<dyn PageContext>,
    watched: Arc<Mutex<Option<ContextId>>>,
    observer: Weak<dyn NavigationObserver>,
}

impl NavigationListener for FilteringListener {
    fn context_created(&self, window: &WindowHandle) {
        let is_page_window = self
            .page
            .window()
            .is_some_and(|current| current.context() == window.context());
        if !is_page_window {
            return;
        }

        *self.watched.lock() = Some(window.context());

        if let Some(observer) = self.observer.upgrade() {
            observer.on_context_created(window.clone());
        }
    }

    fn context_destroyed(&self, context: ContextId) {
        {
            let mut watched = self.watched.lock();
            if *watched != Some(context) {
                return;
            }
            *watched = None;
        }

        if let Some(observer) = self.observer.upgrade() {
            observer.on_context_destroyed(context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryPage;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl NavigationObserver for Recorder {
        fn on_context_created(&self, window: WindowHandle) {
            self.seen.lock().push(format!("created {}", window.context()));
        }

        fn on_context_destroyed(&self, context: ContextId) {
            self.seen.lock().push(format!("destroyed {}", context));
        }
    }

    fn observer_of(recorder: &Arc<Recorder>) -> Weak<dyn NavigationObserver> {
        let weak: Weak<Recorder> = Arc::downgrade(recorder);
        weak
    }

    fn watcher_for(page: &Arc<InMemoryPage>) -> NavigationWatcher {
        NavigationWatcher::new(page.clone(), page.clone())
    }

    #[test]
    fn test_frames_are_filtered_out() {
        let page = InMemoryPage::new();
        let watcher = watcher_for(&page);
        let recorder = Arc::new(Recorder::default());
        let observer = observer_of(&recorder);
        let _subscription = watcher.start(observer);

        let top = page.navigate("https://example.test/");
        let frame = page.open_frame("https://ads.example.test/");
        page.close_frame(frame);

        assert_eq!(*recorder.seen.lock(), vec![format!("created {}", top)]);
        assert_eq!(watcher.watched(), Some(top));
    }

    #[test]
    fn test_destroyed_matches_watched_identity_only() {
        let page = InMemoryPage::new();
        let watcher = watcher_for(&page);
        let recorder = Arc::new(Recorder::default());
        let observer = observer_of(&recorder);
        let _subscription = watcher.start(observer);

        let first = page.navigate("https://example.test/a");
        let second = page.navigate_overlapped("https://example.test/b");

        // the overlapped navigation destroys `first` after `second` exists
        assert_eq!(
            *recorder.seen.lock(),
            vec![format!("created {}", first), format!("created {}", second)]
        );
        assert_eq!(watcher.watched(), Some(second));

        page.navigate("https://example.test/c");
        assert_eq!(recorder.seen.lock()[2], format!("destroyed {}", second));
    }

    #[test]
    fn test_release_unsubscribes() {
        let page = InMemoryPage::new();
        let watcher = watcher_for(&page);
        let recorder = Arc::new(Recorder::default());
        let observer = observer_of(&recorder);

        let subscription = watcher.start(observer.clone());
        assert!(subscription.id().is_some());
        assert_eq!(page.listener_count(), 1);
        subscription.release();
        assert_eq!(page.listener_count(), 0);

        {
            let _dropped = watcher.start(observer);
            assert_eq!(page.listener_count(), 1);
        }
        assert_eq!(page.listener_count(), 0);

        page.navigate("https://example.test/");
        assert!(recorder.seen.lock().is_empty());
    }
}
