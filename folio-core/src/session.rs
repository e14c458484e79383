use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::config::ViewerConfig;
use crate::document::{DocumentId, DocumentProvider, DocumentSource};
use crate::error::OpenError;
use crate::viewer::Viewer;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DocumentOpened(DocumentId),
    DocumentClosed(DocumentId),
    OpenFailed { source: String, message: String },
}

/// Owns at most one open document. Opening another closes the current one
/// and cancels any open still in progress.
pub struct Session {
    config: ViewerConfig,
    viewer: Mutex<Option<Viewer>>,
    open_generation: AtomicU64,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl Session {
    pub fn new(config: ViewerConfig) -> Self {
        Self {
            config,
            viewer: Mutex::new(None),
            open_generation: AtomicU64::new(0),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<SessionEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn viewer(&self) -> Option<Viewer> {
        self.viewer.lock().clone()
    }

    #[instrument(skip(self, provider), fields(source = %source.label()))]
    pub async fn open_with<P>(&self, provider: &P, source: DocumentSource) -> Result<Viewer, OpenError>
    where
        P: DocumentProvider + ?Sized,
    {
        let generation = self.open_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.close();

        let result = Viewer::open(provider, &source, self.config.clone()).await;
        if self.open_generation.load(Ordering::SeqCst) != generation {
            if let Ok(viewer) = result {
                viewer.close();
            }
            info!("open superseded by a newer request");
            return Err(OpenError::Cancelled);
        }

        match result {
            Ok(viewer) => {
                let id = viewer.info().id;
                *self.viewer.lock() = Some(viewer.clone());
                self.events.lock().push(SessionEvent::DocumentOpened(id));
                Ok(viewer)
            }
            Err(err) => {
                warn!(error = %err, "document could not be opened");
                self.events.lock().push(SessionEvent::OpenFailed {
                    source: source.label(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Abandons an open that has not finished yet.
    pub fn cancel_pending_open(&self) {
        self.open_generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn close(&self) -> bool {
        let Some(viewer) = self.viewer.lock().take() else {
            return false;
        };
        viewer.close();
        self.events
            .lock()
            .push(SessionEvent::DocumentClosed(viewer.info().id));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::FakeProvider;

    fn session() -> Session {
        Session::new(ViewerConfig::default())
    }

    #[tokio::test]
    async fn opening_replaces_the_current_document() {
        let session = session();
        let provider = FakeProvider::default();

        let first = session
            .open_with(&provider, FakeProvider::source(4))
            .await
            .unwrap();
        let second = session
            .open_with(&provider, FakeProvider::source(9))
            .await
            .unwrap();

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(session.viewer().unwrap().page_count(), 9);

        let events = session.events().lock().clone();
        assert_eq!(
            events,
            vec![
                SessionEvent::DocumentOpened(first.info().id),
                SessionEvent::DocumentClosed(first.info().id),
                SessionEvent::DocumentOpened(second.info().id),
            ]
        );
    }

    #[tokio::test]
    async fn newer_open_cancels_slower_one() {
        let session = session();
        let provider = FakeProvider::default();
        let gate = provider.hold_open(7);

        let (slow, fast) = tokio::join!(
            session.open_with(&provider, FakeProvider::source(7)),
            async {
                tokio::task::yield_now().await;
                let viewer = session.open_with(&provider, FakeProvider::source(3)).await;
                gate.notify_one();
                viewer
            }
        );

        assert!(matches!(slow, Err(OpenError::Cancelled)));
        assert_eq!(fast.unwrap().page_count(), 3);
        assert_eq!(session.viewer().unwrap().page_count(), 3);
    }

    #[tokio::test]
    async fn failed_open_leaves_no_document() {
        let session = session();
        let provider = FakeProvider::default();

        let err = session
            .open_with(&provider, DocumentSource::Path("/books/broken.pdf".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, OpenError::Backend(_)));

        let err = session
            .open_with(&provider, FakeProvider::source(0))
            .await
            .unwrap_err();
        assert!(matches!(err, OpenError::Empty));

        assert!(session.viewer().is_none());
        assert!(!session.close());
        assert!(session
            .events()
            .lock()
            .iter()
            .all(|event| matches!(event, SessionEvent::OpenFailed { .. })));
    }
}
