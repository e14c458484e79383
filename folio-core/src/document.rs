use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0a2d64-5e1b-5c49-9a57-c6d1f0b4e812").expect("valid namespace UUID")
});

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&*DOCUMENT_NAMESPACE, rendered.as_bytes())
}

pub fn document_id_for_bytes(bytes: &[u8]) -> DocumentId {
    Uuid::new_v5(&*DOCUMENT_NAMESPACE, bytes)
}

/// Where a document's bytes come from.
#[derive(Clone)]
pub enum DocumentSource {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl DocumentSource {
    /// Accepts a filesystem path or a `file://` URL.
    pub fn parse(input: &str) -> Result<Self> {
        if input.contains("://") {
            let url = Url::parse(input).map_err(|err| anyhow!("invalid document URL {input}: {err}"))?;
            if url.scheme() != "file" {
                return Err(anyhow!("unsupported URL scheme {:?}", url.scheme()));
            }
            let path = url
                .to_file_path()
                .map_err(|_| anyhow!("URL {input} does not name a local file"))?;
            return Ok(Self::Path(path));
        }
        Ok(Self::Path(PathBuf::from(input)))
    }

    pub fn id(&self) -> DocumentId {
        match self {
            Self::Path(path) => document_id_for_path(path),
            Self::Bytes(bytes) => document_id_for_bytes(bytes),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Bytes(bytes) => format!("<{} bytes in memory>", bytes.len()),
        }
    }
}

impl fmt::Debug for DocumentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub label: String,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

/// Natural page size in points, independent of zoom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn viewport(self, scale: f32) -> PageViewport {
        PageViewport {
            width: (self.width * scale).max(1.0),
            height: (self.height * scale).max(1.0),
            scale,
        }
    }
}

/// Layout box of a page at a given scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageViewport {
    pub width: f32,
    pub height: f32,
    pub scale: f32,
}

impl PageViewport {
    pub fn pixel_size(&self) -> (u32, u32) {
        (
            self.width.ceil().max(1.0) as u32,
            self.height.ceil().max(1.0) as u32,
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    /// Zero-based page index, as the decoding backend counts pages.
    pub page_index: usize,
    pub viewport: PageViewport,
}

/// An RGBA raster surface.
#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// A run of text with its box in page space (points, origin at the top-left).
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl TextRun {
    pub fn new(text: impl Into<String>, x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            text: text.into(),
            x,
            y,
            width,
            height,
        }
    }
}

/// Table-of-contents node. `target_page` is 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineItem {
    pub title: String,
    pub target_page: usize,
    pub level: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<OutlineItem>,
}

impl OutlineItem {
    /// Depth-first walk over this node and its descendants.
    pub fn flatten(items: &[OutlineItem]) -> Vec<&OutlineItem> {
        let mut out = Vec::new();
        let mut stack: Vec<&OutlineItem> = items.iter().rev().collect();
        while let Some(item) = stack.pop() {
            out.push(item);
            stack.extend(item.children.iter().rev());
        }
        out
    }
}

#[async_trait]
pub trait DocumentHandle: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn page_size(&self, page_index: usize) -> Result<PageSize>;
    async fn render_page(&self, request: RenderRequest) -> Result<RenderImage>;
    async fn positioned_text(&self, page_index: usize) -> Result<Vec<TextRun>>;

    fn outline(&self) -> Result<Vec<OutlineItem>> {
        Ok(Vec::new())
    }
}

#[async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, source: &DocumentSource) -> Result<Arc<dyn DocumentHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn document_id_is_stable_for_same_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sample.pdf");
        std::fs::write(&file_path, b"dummy").unwrap();

        let first = document_id_for_path(&file_path);
        let second = document_id_for_path(&file_path);

        assert_eq!(first, second);
    }

    #[test]
    fn byte_sources_are_identified_by_content() {
        let a = DocumentSource::Bytes(Arc::from(&b"%PDF-1.7 a"[..]));
        let b = DocumentSource::Bytes(Arc::from(&b"%PDF-1.7 a"[..]));
        let c = DocumentSource::Bytes(Arc::from(&b"%PDF-1.7 c"[..]));
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn parse_accepts_file_urls_and_rejects_remote_ones() {
        match DocumentSource::parse("file:///tmp/book.pdf").unwrap() {
            DocumentSource::Path(path) => assert_eq!(path, PathBuf::from("/tmp/book.pdf")),
            other => panic!("unexpected source: {:?}", other),
        }
        assert!(DocumentSource::parse("https://example.com/book.pdf").is_err());
        assert!(matches!(
            DocumentSource::parse("relative/book.pdf").unwrap(),
            DocumentSource::Path(_)
        ));
    }

    #[test]
    fn viewport_scales_page_size() {
        let viewport = PageSize::new(600.0, 800.0).viewport(1.5);
        assert_eq!(viewport.width, 900.0);
        assert_eq!(viewport.height, 1200.0);
        assert_eq!(viewport.pixel_size(), (900, 1200));
    }

    #[test]
    fn flatten_walks_outline_depth_first() {
        let outline = vec![
            OutlineItem {
                title: "One".into(),
                target_page: 1,
                level: 0,
                children: vec![OutlineItem {
                    title: "One.A".into(),
                    target_page: 2,
                    level: 1,
                    children: Vec::new(),
                }],
            },
            OutlineItem {
                title: "Two".into(),
                target_page: 9,
                level: 0,
                children: Vec::new(),
            },
        ];
        let titles: Vec<_> = OutlineItem::flatten(&outline)
            .into_iter()
            .map(|item| item.title.as_str())
            .collect();
        assert_eq!(titles, vec!["One", "One.A", "Two"]);
    }
}
