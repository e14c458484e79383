//! In-memory document backend for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::document::{
    DocumentHandle, DocumentInfo, DocumentMetadata, DocumentProvider, DocumentSource,
    OutlineItem, PageSize, RenderImage, RenderRequest, TextRun,
};

pub(crate) const PAGE_WIDTH: f32 = 600.0;
pub(crate) const PAGE_HEIGHT: f32 = 800.0;

pub(crate) struct FakeDocument {
    info: DocumentInfo,
    calls: Mutex<HashMap<usize, usize>>,
    held: Mutex<HashMap<usize, Arc<Notify>>>,
    failing: Mutex<HashSet<usize>>,
    text: Mutex<HashMap<usize, Vec<TextRun>>>,
}

impl FakeDocument {
    pub(crate) fn new(page_count: usize) -> Self {
        Self {
            info: DocumentInfo {
                id: crate::document::document_id_for_bytes(&page_count.to_le_bytes()),
                label: format!("fake-{page_count}"),
                page_count,
                metadata: DocumentMetadata::default(),
            },
            calls: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            text: Mutex::new(HashMap::new()),
        }
    }

    /// Number of rasterisations of a 1-based page.
    pub(crate) fn render_calls(&self, page: usize) -> usize {
        self.calls.lock().get(&page).copied().unwrap_or(0)
    }

    pub(crate) fn total_render_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub(crate) fn rendered_pages(&self) -> Vec<usize> {
        let mut pages: Vec<_> = self.calls.lock().keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    /// The next render of `page` blocks until the returned gate is notified.
    pub(crate) fn hold_page(&self, page: usize) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.held.lock().insert(page, Arc::clone(&gate));
        gate
    }

    pub(crate) fn fail_page(&self, page: usize) {
        self.failing.lock().insert(page);
    }

    pub(crate) fn heal_page(&self, page: usize) {
        self.failing.lock().remove(&page);
    }

    pub(crate) fn set_text(&self, page: usize, runs: Vec<TextRun>) {
        self.text.lock().insert(page, runs);
    }
}

#[async_trait]
impl DocumentHandle for FakeDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_size(&self, page_index: usize) -> Result<PageSize> {
        if page_index >= self.info.page_count {
            return Err(anyhow!("page {} out of range", page_index));
        }
        Ok(PageSize::new(PAGE_WIDTH, PAGE_HEIGHT))
    }

    async fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        let page = request.page_index + 1;
        *self.calls.lock().entry(page).or_insert(0) += 1;

        let gate = self.held.lock().remove(&page);
        match gate {
            Some(gate) => gate.notified().await,
            None => tokio::task::yield_now().await,
        }

        if self.failing.lock().contains(&page) {
            return Err(anyhow!("corrupt content stream"));
        }
        let (width, height) = request.viewport.pixel_size();
        Ok(RenderImage {
            width,
            height,
            pixels: vec![page as u8; 4],
        })
    }

    async fn positioned_text(&self, page_index: usize) -> Result<Vec<TextRun>> {
        let page = page_index + 1;
        let runs = self.text.lock().get(&page).cloned();
        Ok(runs.unwrap_or_else(|| {
            vec![
                TextRun::new("Page", 72.0, 72.0, 30.0, 12.0),
                TextRun::new(page.to_string(), 106.0, 72.0, 12.0, 12.0),
            ]
        }))
    }

    fn outline(&self) -> Result<Vec<OutlineItem>> {
        Ok(vec![OutlineItem {
            title: "Start".into(),
            target_page: 1,
            level: 0,
            children: vec![OutlineItem {
                title: "Last".into(),
                target_page: self.info.page_count,
                level: 1,
                children: Vec::new(),
            }],
        }])
    }
}

/// Opens `FakeDocument`s whose page count is encoded in the path's file stem.
#[derive(Default)]
pub(crate) struct FakeProvider {
    held: Mutex<HashMap<usize, Arc<Notify>>>,
}

impl FakeProvider {
    pub(crate) fn source(page_count: usize) -> DocumentSource {
        DocumentSource::Path(format!("/books/{page_count}.pdf").into())
    }

    /// The next open of a `page_count`-page document waits for the gate.
    pub(crate) fn hold_open(&self, page_count: usize) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.held.lock().insert(page_count, Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl DocumentProvider for FakeProvider {
    async fn open(&self, source: &DocumentSource) -> Result<Arc<dyn DocumentHandle>> {
        let DocumentSource::Path(path) = source else {
            return Err(anyhow!("fake provider only opens paths"));
        };
        let page_count: usize = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse().ok())
            .ok_or_else(|| anyhow!("not a document: {:?}", path))?;

        let gate = self.held.lock().remove(&page_count);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(Arc::new(FakeDocument::new(page_count)))
    }
}
