use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ViewerConfig;
use crate::document::{
    DocumentHandle, DocumentInfo, DocumentProvider, DocumentSource, OutlineItem, PageSize,
};
use crate::error::{NarrationError, OpenError, RenderError};
use crate::layout::ScrollLayout;
use crate::narration::{
    NarrationLineSequence, NarrationPlayback, NarrationRequest, NarrationSegmenter,
    NarrationService,
};
use crate::navigation::{
    NavigationController, NavigationOutcome, NavigationStep, ScrollBehavior, ScrollCommand,
};
use crate::pipeline::{RenderOutcome, RenderPipeline};
use crate::store::{same_scale, LifecycleState, MountTicket, PageEntry, PageStore, RenderedPage};
use crate::viewport::{ObservationBatch, ViewportState, ViewportTracker};

/// Notifications for the host, drained through [`Viewer::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    PageMounted { page: usize },
    PageRendered { page: usize, scale: f32 },
    PageFailed { page: usize, error: RenderError },
    PageReleased { page: usize },
    CurrentPageChanged { page: usize },
    ScaleChanged { scale: f32 },
    ScrollRequested(ScrollCommand),
    NavigationSuperseded { target: usize },
    NarrationStopped { page: usize },
    Closed,
}

/// What the question-answering collaborator needs from the viewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionContext {
    pub question: String,
    pub current_page: usize,
}

#[derive(Debug, Clone, Copy)]
struct ActiveNarration {
    token: u64,
    page: usize,
}

struct ViewState {
    tracker: ViewportTracker,
    layout: ScrollLayout,
    narration: Option<ActiveNarration>,
    narration_tokens: u64,
}

// Lock order: pipeline in-flight table, then `store`, then `view`.
struct Shared {
    document: Arc<dyn DocumentHandle>,
    info: DocumentInfo,
    config: ViewerConfig,
    page_sizes: Vec<PageSize>,
    pipeline: RenderPipeline,
    navigation: NavigationController,
    segmenter: NarrationSegmenter,
    store: Mutex<PageStore>,
    view: Mutex<ViewState>,
    closed: AtomicBool,
    revision: watch::Sender<u64>,
    events: Arc<Mutex<Vec<ViewerEvent>>>,
}

/// One open document: lazily rendered pages, scroll tracking and navigation.
///
/// Cloning is cheap; clones share the same document and state.
#[derive(Clone)]
pub struct Viewer {
    shared: Arc<Shared>,
}

impl fmt::Debug for Viewer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Viewer")
            .field("id", &self.shared.info.id)
            .field("page_count", &self.shared.info.page_count)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Viewer {
    #[instrument(skip(provider, config), fields(source = %source.label()))]
    pub async fn open<P>(
        provider: &P,
        source: &DocumentSource,
        config: ViewerConfig,
    ) -> Result<Self, OpenError>
    where
        P: DocumentProvider + ?Sized,
    {
        let document = provider.open(source).await.map_err(|err| {
            error!(error = %format!("{err:#}"), "failed to open document");
            OpenError::Backend(err)
        })?;
        Self::from_handle(document, config)
    }

    pub fn from_handle(
        document: Arc<dyn DocumentHandle>,
        config: ViewerConfig,
    ) -> Result<Self, OpenError> {
        let info = document.info().clone();
        if info.page_count == 0 {
            return Err(OpenError::Empty);
        }
        let page_sizes = (0..info.page_count)
            .map(|idx| {
                document
                    .page_size(idx)
                    .map_err(|err| OpenError::PageGeometry {
                        page: idx + 1,
                        message: format!("{err:#}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let scale = config.clamp_scale(config.initial_scale);
        let layout = ScrollLayout::build(&page_sizes, scale, config.page_gap);
        let (revision, _) = watch::channel(0);
        let shared = Shared {
            pipeline: RenderPipeline::new(Arc::clone(&document)),
            navigation: NavigationController::new(config.chunk_size, config.chunk_yield),
            segmenter: NarrationSegmenter::new(&config.narration),
            store: Mutex::new(PageStore::new(info.page_count, scale)),
            view: Mutex::new(ViewState {
                tracker: ViewportTracker::new(config.switch_threshold, config.mount_margin_screens),
                layout,
                narration: None,
                narration_tokens: 0,
            }),
            closed: AtomicBool::new(false),
            revision,
            events: Arc::new(Mutex::new(Vec::new())),
            document,
            info: info.clone(),
            config,
            page_sizes,
        };
        info!(id = %info.id, pages = info.page_count, scale, "document opened");
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn info(&self) -> &DocumentInfo {
        &self.shared.info
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.shared.config
    }

    pub fn page_count(&self) -> usize {
        self.shared.info.page_count
    }

    pub fn contains(&self, page: usize) -> bool {
        page >= 1 && page <= self.page_count()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn scale(&self) -> f32 {
        self.shared.store.lock().scale()
    }

    pub fn current_page(&self) -> usize {
        self.shared.view.lock().tracker.current_page()
    }

    pub fn viewport(&self) -> ViewportState {
        self.shared.view.lock().tracker.state().clone()
    }

    pub fn layout(&self) -> ScrollLayout {
        self.shared.view.lock().layout.clone()
    }

    pub fn page_state(&self, page: usize) -> Option<LifecycleState> {
        self.shared.store.lock().state(page)
    }

    pub fn page_entry(&self, page: usize) -> Option<PageEntry> {
        self.shared.store.lock().get(page).cloned()
    }

    pub fn rendered_page(&self, page: usize) -> Option<RenderedPage> {
        self.shared
            .store
            .lock()
            .get(page)
            .and_then(|entry| entry.rendered().cloned())
    }

    pub fn mounted_pages(&self) -> Vec<usize> {
        self.shared.store.lock().mounted_pages()
    }

    pub fn rendered_count(&self) -> usize {
        self.shared.store.lock().rendered_count()
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ViewerEvent>>> {
        Arc::clone(&self.shared.events)
    }

    pub fn drain_events(&self) -> Vec<ViewerEvent> {
        std::mem::take(&mut *self.shared.events.lock())
    }

    pub fn outline(&self) -> Vec<OutlineItem> {
        match self.shared.document.outline() {
            Ok(outline) => outline,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to read outline");
                Vec::new()
            }
        }
    }

    /// Marks a page eligible for rendering and schedules its render without
    /// waiting for it. Out-of-range pages and already mounted pages are left
    /// alone.
    pub fn ensure_mounted(&self, page: usize) -> Option<MountTicket> {
        if self.is_closed() {
            return None;
        }
        let ticket = self.shared.store.lock().ensure_mounted(page)?;
        self.after_mount(&[page]);
        Some(ticket)
    }

    pub fn release(&self, page: usize) -> bool {
        let released = self.shared.store.lock().release(page);
        if released {
            self.emit(ViewerEvent::PageReleased { page });
            self.bump();
        }
        released
    }

    /// Renders a page at the current scale, mounting it first if needed.
    pub async fn render(&self, page: usize) -> Result<RenderOutcome, RenderError> {
        if self.is_closed() {
            return Err(RenderError::Closed);
        }
        if self.shared.store.lock().ensure_mounted(page).is_some() {
            self.emit(ViewerEvent::PageMounted { page });
            self.bump();
        }
        self.render_mounted(page).await
    }

    async fn render_mounted(&self, page: usize) -> Result<RenderOutcome, RenderError> {
        let scale = self.scale();
        let result = self
            .shared
            .pipeline
            .render(&self.shared.store, page, scale)
            .await;
        match &result {
            Ok(RenderOutcome::Rendered(rendered)) => {
                self.emit(ViewerEvent::PageRendered {
                    page,
                    scale: rendered.scale,
                });
                self.enforce_render_budget();
                self.bump();
            }
            Err(error @ RenderError::Backend { .. }) => {
                self.emit(ViewerEvent::PageFailed {
                    page,
                    error: error.clone(),
                });
                self.bump();
            }
            Err(RenderError::Discarded { .. }) => self.bump(),
            _ => {}
        }
        result
    }

    /// Renders a failed page again. Other pages behave as with [`Viewer::render`].
    pub async fn retry(&self, page: usize) -> Result<RenderOutcome, RenderError> {
        if self.page_state(page) == Some(LifecycleState::Failed) {
            debug!(page, "retrying failed page");
        }
        self.render(page).await
    }

    /// Resolves once the page is rendered at the current scale, rendering it
    /// if nobody else is.
    pub async fn wait_rendered(&self, page: usize) -> Result<RenderedPage, RenderError> {
        let mut revisions = self.shared.revision.subscribe();
        loop {
            match self.render(page).await {
                Ok(RenderOutcome::Rendered(rendered))
                | Ok(RenderOutcome::AlreadyRendered(rendered)) => return Ok(rendered),
                Ok(_) | Err(RenderError::Discarded { .. }) => {}
                Err(error) => return Err(error),
            }
            if revisions.changed().await.is_err() {
                return Err(RenderError::Closed);
            }
        }
    }

    /// Writes the global scale. Every page is released first; only the
    /// visible ones are mounted again.
    #[instrument(skip(self))]
    pub fn set_scale(&self, scale: f32) -> bool {
        if self.is_closed() {
            return false;
        }
        let scale = self.shared.config.clamp_scale(scale);
        let (released, visible) = {
            let mut store = self.shared.store.lock();
            if same_scale(store.scale(), scale) {
                return false;
            }
            let released = store.set_scale(scale);

            let mut guard = self.shared.view.lock();
            let view = &mut *guard;
            let current = view.tracker.current_page();
            let height = view.tracker.state().viewport_height;
            let scroll_top = view.tracker.state().scroll_top;
            let within_page = match view.layout.page_span(current) {
                Some((top, bottom)) if bottom > top => {
                    ((scroll_top - top) / (bottom - top)).clamp(0.0, 1.0)
                }
                _ => 0.0,
            };
            view.layout = ScrollLayout::build(
                &self.shared.page_sizes,
                scale,
                self.shared.config.page_gap,
            );
            let offset = view
                .layout
                .page_span(current)
                .map(|(top, bottom)| top + within_page * (bottom - top))
                .unwrap_or(0.0)
                .min(view.layout.max_scroll(height));
            view.tracker.jump_to(current, offset);
            let visible: Vec<usize> = view
                .tracker
                .visible_pages(&view.layout)
                .into_iter()
                .flatten()
                .collect();
            (released, visible)
        };

        info!(scale, released = released.len(), "render scale changed");
        self.emit(ViewerEvent::ScaleChanged { scale });
        for page in released {
            self.emit(ViewerEvent::PageReleased { page });
        }
        self.bump();
        for page in visible {
            self.ensure_mounted(page);
        }
        true
    }

    pub fn zoom_in(&self) -> bool {
        self.set_scale(round_scale(self.scale() + self.shared.config.zoom_step))
    }

    pub fn zoom_out(&self) -> bool {
        self.set_scale(round_scale(self.scale() - self.shared.config.zoom_step))
    }

    /// Host scroll event. Returns the new current page if it changed.
    pub fn scroll_to(&self, scroll_top: f32) -> Option<usize> {
        self.update_viewport(Some(scroll_top), None)
    }

    /// Host resize event. Returns the new current page if it changed.
    pub fn resize(&self, viewport_height: f32) -> Option<usize> {
        self.update_viewport(None, Some(viewport_height))
    }

    /// Reserves the tick for an externally measured observation batch.
    pub fn begin_observation(&self) -> u64 {
        self.shared.view.lock().tracker.begin_batch()
    }

    /// Applies intersection ratios measured by the host. Samples for pages
    /// that are not mounted are ignored.
    pub fn observe(&self, mut batch: ObservationBatch) -> Option<usize> {
        if self.is_closed() {
            return None;
        }
        let changed = {
            let mut store = self.shared.store.lock();
            let mut view = self.shared.view.lock();
            batch.samples.retain(|sample| {
                store
                    .get(sample.page)
                    .map(PageEntry::is_mounted)
                    .unwrap_or(false)
            });
            if batch.tick > view.tracker.state().applied_tick {
                for sample in &batch.samples {
                    store.mark_visible(sample.page, batch.tick);
                }
            }
            view.tracker.apply(batch)
        };
        if let Some(page) = changed {
            self.on_current_page_changed(page);
        }
        changed
    }

    /// Sole navigation entry point. Distant targets are approached in
    /// chunks so that only a bounded number of pages is rendered on the way.
    #[instrument(skip(self))]
    pub async fn go_to(&self, target: usize) -> NavigationOutcome {
        if self.is_closed() || !self.contains(target) {
            debug!(target, "navigation target not available");
            return NavigationOutcome::NotFound;
        }
        let navigation = &self.shared.navigation;
        let request = navigation.begin(target, self.current_page());
        let mut chunk_steps = 0;

        loop {
            if !navigation.is_active(&request) {
                debug!(target, "navigation superseded");
                self.emit(ViewerEvent::NavigationSuperseded { target });
                return NavigationOutcome::Superseded;
            }
            match navigation.plan(self.current_page(), target) {
                NavigationStep::Chunk(intermediate) => {
                    self.ensure_mounted(intermediate);
                    if let Err(error) = self.wait_rendered(intermediate).await {
                        warn!(page = intermediate, %error, "intermediate page did not render");
                    }
                    if !navigation.is_active(&request) {
                        continue;
                    }
                    self.scroll_to_page(intermediate, ScrollBehavior::Immediate);
                    chunk_steps += 1;
                    navigation.pause().await;
                }
                NavigationStep::Arrive => {
                    self.ensure_mounted(target);
                    let behavior = if request.long_jump {
                        ScrollBehavior::Immediate
                    } else {
                        ScrollBehavior::Smooth
                    };
                    if self.scroll_to_page(target, behavior).is_none() {
                        return NavigationOutcome::NotFound;
                    }
                    self.ensure_mounted(target.saturating_sub(1));
                    self.ensure_mounted(target + 1);
                    debug!(target, chunk_steps, "navigation finished");
                    return NavigationOutcome::Arrived {
                        page: target,
                        chunk_steps,
                    };
                }
            }
        }
    }

    pub async fn next_page(&self) -> NavigationOutcome {
        self.go_to(self.current_page() + 1).await
    }

    pub async fn prev_page(&self) -> NavigationOutcome {
        self.go_to(self.current_page().saturating_sub(1)).await
    }

    pub async fn go_to_outline(&self, item: &OutlineItem) -> NavigationOutcome {
        self.go_to(item.target_page).await
    }

    /// Line-grouped text of a rendered page.
    pub fn extract_lines(&self, page: usize) -> Result<Vec<String>, NarrationError> {
        let store = self.shared.store.lock();
        let entry = store.get(page).ok_or(NarrationError::OutOfRange { page })?;
        let rendered = entry.rendered().ok_or(NarrationError::NotReady { page })?;
        Ok(self.shared.segmenter.extract_lines(rendered))
    }

    /// Waits for the page's text layer, then builds its line sequence.
    pub async fn narration_sequence(
        &self,
        page: usize,
        speed: f32,
    ) -> Result<NarrationLineSequence, NarrationError> {
        if !self.contains(page) {
            return Err(NarrationError::OutOfRange { page });
        }
        let rendered = self.wait_rendered(page).await?;
        let lines = self.shared.segmenter.extract_lines(&rendered);
        if lines.is_empty() {
            return Err(NarrationError::NoText { page });
        }
        let speed = self.shared.config.narration.clamp_speed(speed);
        Ok(self.shared.segmenter.sequence(page, lines, speed))
    }

    #[instrument(skip(self, service))]
    pub async fn narrate<S>(
        &self,
        page: usize,
        voice_id: &str,
        speed: f32,
        service: &S,
    ) -> Result<NarrationPlayback, NarrationError>
    where
        S: NarrationService + ?Sized,
    {
        let sequence = self.narration_sequence(page, speed).await?;
        let request = NarrationRequest {
            page_number: page,
            lines: sequence.texts(),
            voice_id: voice_id.to_owned(),
            speed: sequence.speed(),
        };
        let audio = service.synthesize(&request).await.map_err(|err| {
            warn!(page, error = %format!("{err:#}"), "speech synthesis failed");
            NarrationError::Synthesis(format!("{err:#}"))
        })?;

        let (token, previous) = {
            let mut view = self.shared.view.lock();
            view.narration_tokens += 1;
            let token = view.narration_tokens;
            let previous = view.narration.replace(ActiveNarration { token, page });
            (token, previous)
        };
        if let Some(previous) = previous {
            self.emit(ViewerEvent::NarrationStopped {
                page: previous.page,
            });
        }
        debug!(page, lines = sequence.lines().len(), "narration started");
        Ok(NarrationPlayback {
            token,
            sequence,
            audio,
        })
    }

    pub fn stop_narration(&self) -> bool {
        let stopped = self.shared.view.lock().narration.take();
        match stopped {
            Some(narration) => {
                self.emit(ViewerEvent::NarrationStopped {
                    page: narration.page,
                });
                true
            }
            None => false,
        }
    }

    pub fn is_narration_live(&self, playback: &NarrationPlayback) -> bool {
        self.shared
            .view
            .lock()
            .narration
            .map(|active| active.token == playback.token)
            .unwrap_or(false)
    }

    pub fn question_context(&self, question: impl Into<String>) -> QuestionContext {
        QuestionContext {
            question: question.into(),
            current_page: self.current_page(),
        }
    }

    /// Releases every page and abandons in-flight navigation. Renders still
    /// running are discarded when they complete.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.navigation.cancel();
        let released = self.shared.store.lock().release_all();
        self.shared.view.lock().narration = None;
        info!(id = %self.shared.info.id, released = released.len(), "document closed");
        for page in released {
            self.emit(ViewerEvent::PageReleased { page });
        }
        self.emit(ViewerEvent::Closed);
        self.bump();
    }

    fn update_viewport(&self, scroll_top: Option<f32>, viewport_height: Option<f32>) -> Option<usize> {
        if self.is_closed() {
            return None;
        }
        let (mounted, changed) = {
            let mut store = self.shared.store.lock();
            let mut guard = self.shared.view.lock();
            let view = &mut *guard;
            let height = viewport_height.unwrap_or(view.tracker.state().viewport_height);
            let top = scroll_top
                .unwrap_or(view.tracker.state().scroll_top)
                .clamp(0.0, view.layout.max_scroll(height));
            view.tracker.set_geometry(top, height);

            let mut mounted = Vec::new();
            if let Some(window) = view.tracker.mount_window(&view.layout) {
                for page in window {
                    if store.ensure_mounted(page).is_some() {
                        mounted.push(page);
                    }
                }
            }
            let batch = view.tracker.sample(&view.layout, |page| {
                store.get(page).map(PageEntry::is_mounted).unwrap_or(false)
            });
            for sample in &batch.samples {
                store.mark_visible(sample.page, batch.tick);
            }
            (mounted, view.tracker.apply(batch))
        };

        self.after_mount(&mounted);
        if let Some(page) = changed {
            self.on_current_page_changed(page);
        }
        changed
    }

    fn scroll_to_page(&self, page: usize, behavior: ScrollBehavior) -> Option<ScrollCommand> {
        let (command, changed) = {
            let mut guard = self.shared.view.lock();
            let view = &mut *guard;
            let top = view.layout.page_top(page)?;
            let offset = top.min(view.layout.max_scroll(view.tracker.state().viewport_height));
            let changed = view.tracker.jump_to(page, offset);
            (
                ScrollCommand {
                    page,
                    offset,
                    behavior,
                },
                changed,
            )
        };
        self.emit(ViewerEvent::ScrollRequested(command));
        if changed {
            self.on_current_page_changed(page);
        }
        Some(command)
    }

    fn on_current_page_changed(&self, page: usize) {
        self.emit(ViewerEvent::CurrentPageChanged { page });
        let stopped = self.shared.view.lock().narration.take();
        if let Some(narration) = stopped {
            self.emit(ViewerEvent::NarrationStopped {
                page: narration.page,
            });
        }
        self.bump();
    }

    fn after_mount(&self, pages: &[usize]) {
        if pages.is_empty() {
            return;
        }
        for &page in pages {
            self.emit(ViewerEvent::PageMounted { page });
            self.schedule_render(page);
        }
        self.bump();
    }

    fn schedule_render(&self, page: usize) {
        match Handle::try_current() {
            Ok(handle) => {
                let viewer = self.clone();
                handle.spawn(async move {
                    if viewer.is_closed()
                        || viewer.page_state(page) == Some(LifecycleState::Unmounted)
                    {
                        trace!(page, "page released before its background render");
                        return;
                    }
                    if let Err(error) = viewer.render_mounted(page).await {
                        debug!(page, %error, "background render did not complete");
                    }
                });
            }
            Err(_) => debug!(page, "no async runtime, page stays mounted until rendered"),
        }
    }

    fn enforce_render_budget(&self) {
        let Some(limit) = self.shared.config.max_rendered_pages else {
            return;
        };
        let evicted = {
            let mut store = self.shared.store.lock();
            let view = self.shared.view.lock();
            let current = view.tracker.current_page();
            let keep = view
                .tracker
                .mount_window(&view.layout)
                .unwrap_or(current..=current);
            store.evict_least_recent(limit, keep)
        };
        for page in evicted {
            self.emit(ViewerEvent::PageReleased { page });
        }
    }

    fn emit(&self, event: ViewerEvent) {
        self.shared.events.lock().push(event);
    }

    fn bump(&self) {
        self.shared.revision.send_modify(|revision| *revision += 1);
    }
}

fn round_scale(scale: f32) -> f32 {
    (scale * 100.0).round() / 100.0
}
