use std::convert::TryFrom;
use std::env;
use std::mem;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use folio_core::{
    DocumentHandle, DocumentInfo, DocumentMetadata, DocumentProvider, DocumentSource,
    OutlineItem, PageSize, RenderImage, RenderRequest, TextRun,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, instrument, warn};

/// Overrides where the pdfium shared library is loaded from.
pub const LIBRARY_PATH_ENV: &str = "FOLIO_PDFIUM_LIBRARY_PATH";

pub struct PdfiumProvider {
    pdfium: Arc<Pdfium>,
}

impl PdfiumProvider {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumProvider {
    #[instrument(skip(self))]
    async fn open(&self, source: &DocumentSource) -> Result<Arc<dyn DocumentHandle>> {
        let document = PdfiumDocument::load(Arc::clone(&self.pdfium), source)?;
        debug!(pages = document.info.page_count, "pdf loaded");
        Ok(Arc::new(document))
    }
}

struct PdfiumDocument {
    info: DocumentInfo,
    page_sizes: Vec<PageSize>,
    outline_cache: Mutex<Option<Vec<OutlineItem>>>,
    pdf: Arc<LoadedPdf>,
}

/// The pdfium document together with the bindings it borrows. Shared with
/// blocking tasks that rasterise and extract text.
struct LoadedPdf {
    // Declared before `_pdfium` so it is dropped first.
    document: Mutex<PdfDocument<'static>>,
    _pdfium: Arc<Pdfium>,
}

impl LoadedPdf {
    fn with_page<R, F>(&self, page_index: usize, f: F) -> Result<R>
    where
        F: FnOnce(&PdfPage<'_>) -> Result<R>,
    {
        let index = PdfPageIndex::try_from(page_index)
            .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
        let document = self.document.lock();
        let page = document
            .pages()
            .get(index)
            .with_context(|| format!("page {} out of range", page_index))?;
        f(&page)
    }
}

impl PdfiumDocument {
    fn load(pdfium: Arc<Pdfium>, source: &DocumentSource) -> Result<Self> {
        let document = match source {
            DocumentSource::Path(path) => pdfium
                .load_pdf_from_file(path, None)
                .with_context(|| format!("failed to open {:?}", path))?,
            DocumentSource::Bytes(bytes) => pdfium
                .load_pdf_from_byte_vec(bytes.to_vec(), None)
                .context("failed to parse in-memory document")?,
        };
        // SAFETY: the document borrows the bindings behind `pdfium`. Both live
        // in `LoadedPdf`, the Arc keeps the bindings at a fixed address, and
        // `document` is declared first so it is dropped before them.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };

        let page_sizes = document
            .pages()
            .iter()
            .map(|page| PageSize::new(page.width().value, page.height().value))
            .collect::<Vec<_>>();
        let info = DocumentInfo {
            id: source.id(),
            label: source.label(),
            page_count: page_sizes.len(),
            metadata: read_metadata(&document),
        };

        Ok(Self {
            info,
            page_sizes,
            outline_cache: Mutex::new(None),
            pdf: Arc::new(LoadedPdf {
                document: Mutex::new(document),
                _pdfium: pdfium,
            }),
        })
    }

    /// Runs `f` against one page on the blocking pool.
    async fn on_page<R, F>(&self, page_index: usize, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&PdfPage<'_>) -> Result<R> + Send + 'static,
    {
        let pdf = Arc::clone(&self.pdf);
        tokio::task::spawn_blocking(move || pdf.with_page(page_index, f))
            .await
            .with_context(|| format!("pdfium task for page {} did not finish", page_index))?
    }
}

#[async_trait]
impl DocumentHandle for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_size(&self, page_index: usize) -> Result<PageSize> {
        self.page_sizes
            .get(page_index)
            .copied()
            .ok_or_else(|| anyhow!("page {} out of range", page_index))
    }

    #[instrument(skip(self), fields(page = request.page_index))]
    async fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        self.on_page(request.page_index, move |page| {
            let config =
                PdfRenderConfig::new().scale_page_by_factor(request.viewport.scale.max(0.1));
            let bitmap = page
                .render_with_config(&config)
                .with_context(|| format!("failed to render page {}", request.page_index))?;
            let pixels = bitmap.as_image().to_rgba8().into_raw();
            Ok(RenderImage {
                width: u32::try_from(bitmap.width()).unwrap_or_default(),
                height: u32::try_from(bitmap.height()).unwrap_or_default(),
                pixels,
            })
        })
        .await
    }

    async fn positioned_text(&self, page_index: usize) -> Result<Vec<TextRun>> {
        self.on_page(page_index, move |page| {
            let page_height = page.height().value;
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;
            let runs = text
                .segments()
                .iter()
                .map(|segment| {
                    let bounds = segment.bounds();
                    top_origin_run(
                        segment.text(),
                        PdfBox {
                            left: bounds.left().value,
                            bottom: bounds.bottom().value,
                            right: bounds.right().value,
                            top: bounds.top().value,
                        },
                        page_height,
                    )
                })
                .collect();
            Ok(runs)
        })
        .await
    }

    fn outline(&self) -> Result<Vec<OutlineItem>> {
        {
            let cache = self.outline_cache.lock();
            if let Some(cached) = cache.as_ref() {
                return Ok(cached.clone());
            }
        }

        let outline = {
            let document = self.pdf.document.lock();
            let root = document.bookmarks().root();
            root.map(|first| collect_outline(first, 0))
                .unwrap_or_default()
        };

        *self.outline_cache.lock() = Some(outline.clone());
        Ok(outline)
    }
}

/// A rectangle in PDF user space, origin at the bottom-left.
#[derive(Debug, Clone, Copy)]
struct PdfBox {
    left: f32,
    bottom: f32,
    right: f32,
    top: f32,
}

fn top_origin_run(text: String, bounds: PdfBox, page_height: f32) -> TextRun {
    TextRun::new(
        text,
        bounds.left,
        page_height - bounds.top,
        (bounds.right - bounds.left).max(0.0),
        (bounds.top - bounds.bottom).max(0.0),
    )
}

fn collect_outline(first: PdfBookmark<'_>, level: usize) -> Vec<OutlineItem> {
    let mut items = Vec::new();
    let mut next = Some(first);
    while let Some(bookmark) = next {
        let children = bookmark
            .first_child()
            .map(|child| collect_outline(child, level + 1))
            .unwrap_or_default();
        let target_page = bookmark
            .destination()
            .and_then(|destination| destination.page_index().ok())
            .map(|index| index as usize + 1);

        match (bookmark.title(), target_page) {
            (Some(title), Some(target_page)) => items.push(OutlineItem {
                title,
                target_page,
                level,
                children,
            }),
            // Entries without a destination still surface their children.
            _ => items.extend(children),
        }
        next = bookmark.next_sibling();
    }
    items
}

fn read_metadata(document: &PdfDocument<'_>) -> DocumentMetadata {
    let metadata = document.metadata();
    let title = metadata
        .get(PdfDocumentMetadataTagType::Title)
        .map(|t| t.value().to_owned())
        .filter(|title| !title.trim().is_empty());
    let author = metadata
        .get(PdfDocumentMetadataTagType::Author)
        .map(|t| t.value().to_owned())
        .filter(|author| !author.trim().is_empty());
    let keywords = metadata
        .get(PdfDocumentMetadataTagType::Keywords)
        .map(|t| split_keywords(t.value()))
        .unwrap_or_default();

    DocumentMetadata {
        title,
        author,
        keywords,
    }
}

fn split_keywords(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|keyword| !keyword.is_empty())
        .map(str::to_owned)
        .collect()
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    let path = env::var_os(LIBRARY_PATH_ENV)?;
    if path.is_empty() {
        return None;
    }
    match Pdfium::bind_to_library(&path) {
        Ok(bindings) => Some(Pdfium::new(bindings)),
        Err(err) => {
            warn!(
                "failed to load pdfium from {} ({:?}): {}",
                LIBRARY_PATH_ENV, path, err
            );
            None
        }
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => errors.push(format!("{}: {}", cwd_path.display(), err)),
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; install it or set {} ({})",
                LIBRARY_PATH_ENV,
                errors.join(", ")
            ))
        }
    }
}
