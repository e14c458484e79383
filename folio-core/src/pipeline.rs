use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::document::{DocumentHandle, PageViewport, RenderRequest, TextRun};
use crate::error::RenderError;
use crate::store::{same_scale, Completion, PageStore, RenderedPage};

/// A text run placed in viewport coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionedRun {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Overlay of positioned text matching the raster surface's dimensions.
/// Runs keep the order the document reports them in.
#[derive(Debug, Clone)]
pub struct TextLayer {
    pub width: f32,
    pub height: f32,
    pub scale: f32,
    pub runs: Vec<PositionedRun>,
}

impl TextLayer {
    pub fn empty(width: f32, height: f32, scale: f32) -> Self {
        Self {
            width,
            height,
            scale,
            runs: Vec::new(),
        }
    }

    pub fn layout(runs: Vec<TextRun>, viewport: PageViewport) -> Self {
        let scale = viewport.scale;
        let runs = runs
            .into_iter()
            .filter(|run| !run.text.is_empty())
            .map(|run| PositionedRun {
                text: run.text,
                x: run.x * scale,
                y: run.y * scale,
                width: run.width * scale,
                height: run.height * scale,
            })
            .collect();
        Self {
            width: viewport.width,
            height: viewport.height,
            scale,
            runs,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.runs.iter().all(|run| run.text.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub enum RenderOutcome {
    Rendered(RenderedPage),
    /// Already rendered at the requested scale; the existing artifacts.
    AlreadyRendered(RenderedPage),
    /// A render at the same scale is in flight and will satisfy this request.
    Coalesced,
    /// A render at another scale is in flight; this one runs after it.
    Queued,
    /// The requested scale is not the global scale.
    Stale,
}

impl RenderOutcome {
    pub fn page(&self) -> Option<&RenderedPage> {
        match self {
            Self::Rendered(page) | Self::AlreadyRendered(page) => Some(page),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    scale: f32,
    /// Entry generation the running render will present to.
    generation: u64,
    queued: Option<f32>,
}

enum Step {
    Again { scale: f32, generation: u64 },
    Done(Completion),
}

/// Produces raster surfaces and text layers, one render per page at a time.
pub struct RenderPipeline {
    document: Arc<dyn DocumentHandle>,
    in_flight: Mutex<HashMap<usize, InFlight>>,
}

impl RenderPipeline {
    pub fn new(document: Arc<dyn DocumentHandle>) -> Self {
        Self {
            document,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_in_flight(&self, page: usize) -> bool {
        self.in_flight.lock().contains_key(&page)
    }

    #[instrument(level = "debug", skip(self, store))]
    pub async fn render(
        &self,
        store: &Mutex<PageStore>,
        page: usize,
        scale: f32,
    ) -> Result<RenderOutcome, RenderError> {
        let (mut scale, mut generation) = {
            let mut flights = self.in_flight.lock();
            let mut store = store.lock();
            let Some(entry) = store.get(page) else {
                return Err(RenderError::OutOfRange { page });
            };
            if let Some(flight) = flights.get_mut(&page) {
                // A render started before the entry was released cannot land.
                if same_scale(flight.scale, scale) && flight.generation == entry.generation() {
                    flight.queued = None;
                    trace!(page, scale, "coalesced with in-flight render");
                    return Ok(RenderOutcome::Coalesced);
                }
                flight.queued = Some(scale);
                trace!(page, scale, in_flight = flight.scale, "queued behind in-flight render");
                return Ok(RenderOutcome::Queued);
            }
            if let Some(rendered) = entry.rendered() {
                if same_scale(rendered.scale, scale) {
                    return Ok(RenderOutcome::AlreadyRendered(rendered.clone()));
                }
            }
            let Some(generation) = store.begin_render(page, scale) else {
                debug!(page, scale, global = store.scale(), "ignoring render at stale scale");
                return Ok(RenderOutcome::Stale);
            };
            flights.insert(
                page,
                InFlight {
                    scale,
                    generation,
                    queued: None,
                },
            );
            (scale, generation)
        };

        loop {
            let result = self.rasterize(page, scale).await;
            let step = {
                let mut flights = self.in_flight.lock();
                let mut store = store.lock();
                let completion = store.finish_render(page, generation, result);
                let queued = flights.get_mut(&page).and_then(|flight| flight.queued.take());
                let next = queued.and_then(|next_scale| {
                    store
                        .begin_render(page, next_scale)
                        .map(|next_generation| (next_scale, next_generation))
                });
                match next {
                    Some((next_scale, next_generation)) => {
                        if let Some(flight) = flights.get_mut(&page) {
                            flight.scale = next_scale;
                            flight.generation = next_generation;
                        }
                        Step::Again {
                            scale: next_scale,
                            generation: next_generation,
                        }
                    }
                    None => {
                        flights.remove(&page);
                        Step::Done(completion)
                    }
                }
            };

            match step {
                Step::Again {
                    scale: next_scale,
                    generation: next_generation,
                } => {
                    debug!(page, from = scale, to = next_scale, "running queued render");
                    scale = next_scale;
                    generation = next_generation;
                }
                Step::Done(Completion::Rendered(rendered)) => {
                    debug!(page, scale, "page rendered");
                    return Ok(RenderOutcome::Rendered(rendered));
                }
                Step::Done(Completion::Failed(error)) => {
                    warn!(page, scale, %error, "page render failed");
                    return Err(error);
                }
                Step::Done(Completion::Discarded) => {
                    debug!(page, scale, "render result discarded");
                    return Err(RenderError::Discarded { page });
                }
            }
        }
    }

    async fn rasterize(&self, page: usize, scale: f32) -> Result<RenderedPage, RenderError> {
        let page_index = page - 1;
        let backend_error = |err: anyhow::Error| RenderError::Backend {
            page,
            message: format!("{err:#}"),
        };

        let size = self.document.page_size(page_index).map_err(backend_error)?;
        let viewport = size.viewport(scale);
        let surface = self
            .document
            .render_page(RenderRequest {
                page_index,
                viewport,
            })
            .await
            .map_err(backend_error)?;
        let runs = self
            .document
            .positioned_text(page_index)
            .await
            .map_err(backend_error)?;

        Ok(RenderedPage {
            page_number: page,
            scale,
            surface: Arc::new(surface),
            text_layer: Arc::new(TextLayer::layout(runs, viewport)),
        })
    }
}
