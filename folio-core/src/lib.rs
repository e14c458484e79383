//! Lazy, viewport-driven page rendering and navigation for paginated
//! documents.
//!
//! A [`Viewer`] owns one open document. Pages are rendered only while they
//! are near the visible area, always at the viewer's single global scale,
//! and long jumps are walked in bounded chunks.

pub mod config;
pub mod document;
pub mod error;
pub mod layout;
pub mod narration;
pub mod navigation;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod viewer;
pub mod viewport;

#[cfg(test)]
mod fixtures;

pub use config::{NarrationConfig, ViewerConfig};
pub use document::{
    document_id_for_bytes, document_id_for_path, DocumentHandle, DocumentId, DocumentInfo,
    DocumentMetadata, DocumentProvider, DocumentSource, OutlineItem, PageSize, PageViewport,
    RenderImage, RenderRequest, TextRun,
};
pub use error::{NarrationError, OpenError, RenderError};
pub use layout::ScrollLayout;
pub use narration::{
    NarrationAudio, NarrationLine, NarrationLineSequence, NarrationPlayback, NarrationRequest,
    NarrationSegmenter, NarrationService,
};
pub use navigation::{NavigationOutcome, ScrollBehavior, ScrollCommand};
pub use pipeline::{PositionedRun, RenderOutcome, TextLayer};
pub use session::{Session, SessionEvent};
pub use store::{LifecycleState, MountTicket, PageEntry, RenderedPage};
pub use viewer::{QuestionContext, Viewer, ViewerEvent};
pub use viewport::{IntersectionSample, ObservationBatch, ViewportState};
