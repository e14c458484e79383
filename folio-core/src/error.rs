use thiserror::Error;

/// Fatal to the session: nothing of the document is retained.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("failed to open document: {0:#}")]
    Backend(#[source] anyhow::Error),
    #[error("failed to read the size of page {page}: {message}")]
    PageGeometry { page: usize, message: String },
    #[error("document has no pages")]
    Empty,
    #[error("open was superseded by a newer document")]
    Cancelled,
}

/// Page-scoped and retryable; lives inside a `Failed` page entry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    #[error("page {page} is out of range")]
    OutOfRange { page: usize },
    #[error("failed to render page {page}: {message}")]
    Backend { page: usize, message: String },
    #[error("render of page {page} was discarded after its entry was released")]
    Discarded { page: usize },
    #[error("viewer is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NarrationError {
    #[error("page {page} is out of range")]
    OutOfRange { page: usize },
    #[error("page {page} has no rendered text layer yet")]
    NotReady { page: usize },
    #[error("page {page} has no narratable text")]
    NoText { page: usize },
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
}
