use std::ops::RangeInclusive;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::document::RenderImage;
use crate::error::RenderError;
use crate::pipeline::TextLayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Unmounted,
    Mounted,
    Rendering,
    Rendered,
    Failed,
}

/// Owned artifacts of a successfully rendered page.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub page_number: usize,
    pub scale: f32,
    pub surface: Arc<RenderImage>,
    pub text_layer: Arc<TextLayer>,
}

#[derive(Debug, Clone)]
enum PageSlot {
    Unmounted,
    Mounted,
    Rendering { scale: f32 },
    Rendered(RenderedPage),
    Failed(RenderError),
}

#[derive(Debug, Clone)]
pub struct PageEntry {
    page_number: usize,
    slot: PageSlot,
    generation: u64,
    last_visible: u64,
}

impl PageEntry {
    fn new(page_number: usize) -> Self {
        Self {
            page_number,
            slot: PageSlot::Unmounted,
            generation: 0,
            last_visible: 0,
        }
    }

    pub fn page_number(&self) -> usize {
        self.page_number
    }

    pub fn state(&self) -> LifecycleState {
        match self.slot {
            PageSlot::Unmounted => LifecycleState::Unmounted,
            PageSlot::Mounted => LifecycleState::Mounted,
            PageSlot::Rendering { .. } => LifecycleState::Rendering,
            PageSlot::Rendered(_) => LifecycleState::Rendered,
            PageSlot::Failed(_) => LifecycleState::Failed,
        }
    }

    /// Scale of the owned surface; `None` unless rendered.
    pub fn render_scale(&self) -> Option<f32> {
        match &self.slot {
            PageSlot::Rendered(page) => Some(page.scale),
            _ => None,
        }
    }

    pub fn rendered(&self) -> Option<&RenderedPage> {
        match &self.slot {
            PageSlot::Rendered(page) => Some(page),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&RenderError> {
        match &self.slot {
            PageSlot::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_visible(&self) -> u64 {
        self.last_visible
    }

    pub fn is_mounted(&self) -> bool {
        !matches!(self.slot, PageSlot::Unmounted)
    }

    fn reset(&mut self) -> bool {
        let was_mounted = self.is_mounted();
        self.slot = PageSlot::Unmounted;
        self.generation += 1;
        was_mounted
    }
}

/// Proof that a mount happened; stale once the entry's generation moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountTicket {
    pub page_number: usize,
    pub generation: u64,
}

/// What `finish_render` did with a completed render.
#[derive(Debug, Clone)]
pub enum Completion {
    Rendered(RenderedPage),
    Failed(RenderError),
    /// The entry was released or the global scale moved on meanwhile.
    Discarded,
}

/// Arena of page entries indexed by 1-based page number.
///
/// The store also owns the global render scale: changing it sweeps every
/// entry back to `Unmounted` before any new render can complete, so no entry
/// is ever observed rendered at a scale other than the current one.
#[derive(Debug)]
pub struct PageStore {
    entries: Vec<PageEntry>,
    scale: f32,
}

impl PageStore {
    pub fn new(page_count: usize, scale: f32) -> Self {
        Self {
            entries: (1..=page_count).map(PageEntry::new).collect(),
            scale,
        }
    }

    pub fn page_count(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, page: usize) -> bool {
        page >= 1 && page <= self.entries.len()
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn get(&self, page: usize) -> Option<&PageEntry> {
        page.checked_sub(1).and_then(|idx| self.entries.get(idx))
    }

    fn get_mut(&mut self, page: usize) -> Option<&mut PageEntry> {
        page.checked_sub(1).and_then(|idx| self.entries.get_mut(idx))
    }

    pub fn state(&self, page: usize) -> Option<LifecycleState> {
        self.get(page).map(PageEntry::state)
    }

    pub fn ensure_mounted(&mut self, page: usize) -> Option<MountTicket> {
        let entry = self.get_mut(page)?;
        if !matches!(entry.slot, PageSlot::Unmounted) {
            return None;
        }
        entry.slot = PageSlot::Mounted;
        trace!(page, "page mounted");
        Some(MountTicket {
            page_number: page,
            generation: entry.generation,
        })
    }

    pub fn release(&mut self, page: usize) -> bool {
        match self.get_mut(page) {
            Some(entry) => {
                let released = entry.reset();
                if released {
                    trace!(page, "page released");
                }
                released
            }
            None => false,
        }
    }

    /// Returns the page numbers that were mounted before the sweep.
    pub fn release_all(&mut self) -> Vec<usize> {
        self.entries
            .iter_mut()
            .filter_map(|entry| entry.reset().then_some(entry.page_number))
            .collect()
    }

    /// Writes the global scale and runs the invalidation sweep. Returns the
    /// released pages; empty when the scale did not change.
    pub fn set_scale(&mut self, scale: f32) -> Vec<usize> {
        if same_scale(self.scale, scale) {
            return Vec::new();
        }
        self.scale = scale;
        let released = self.release_all();
        debug!(scale, released = released.len(), "scale changed, pages invalidated");
        released
    }

    /// Moves the entry into `Rendering` and returns the generation the render
    /// must present on completion. Refuses out-of-range pages and scales other
    /// than the global one.
    pub(crate) fn begin_render(&mut self, page: usize, scale: f32) -> Option<u64> {
        if !same_scale(self.scale, scale) {
            return None;
        }
        let entry = self.get_mut(page)?;
        entry.slot = PageSlot::Rendering { scale };
        Some(entry.generation)
    }

    pub(crate) fn finish_render(
        &mut self,
        page: usize,
        generation: u64,
        result: Result<RenderedPage, RenderError>,
    ) -> Completion {
        let global_scale = self.scale;
        let Some(entry) = self.get_mut(page) else {
            return Completion::Discarded;
        };
        let in_flight_scale = match entry.slot {
            PageSlot::Rendering { scale } if entry.generation == generation => scale,
            _ => return Completion::Discarded,
        };
        if !same_scale(in_flight_scale, global_scale) {
            entry.reset();
            return Completion::Discarded;
        }
        match result {
            Ok(rendered) => {
                entry.slot = PageSlot::Rendered(rendered.clone());
                Completion::Rendered(rendered)
            }
            Err(error) => {
                entry.slot = PageSlot::Failed(error.clone());
                Completion::Failed(error)
            }
        }
    }

    pub fn mark_visible(&mut self, page: usize, tick: u64) {
        if let Some(entry) = self.get_mut(page) {
            entry.last_visible = entry.last_visible.max(tick);
        }
    }

    pub fn mounted_pages(&self) -> Vec<usize> {
        self.entries
            .iter()
            .filter(|entry| entry.is_mounted())
            .map(PageEntry::page_number)
            .collect()
    }

    pub fn rendered_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.slot, PageSlot::Rendered(_)))
            .count()
    }

    /// Releases rendered pages, least recently visible first, until at most
    /// `limit` remain. Pages inside `keep` are never evicted.
    pub fn evict_least_recent(&mut self, limit: usize, keep: RangeInclusive<usize>) -> Vec<usize> {
        let rendered = self.rendered_count();
        if rendered <= limit {
            return Vec::new();
        }
        let mut candidates: Vec<(u64, usize)> = self
            .entries
            .iter()
            .filter(|entry| {
                matches!(entry.slot, PageSlot::Rendered(_)) && !keep.contains(&entry.page_number)
            })
            .map(|entry| (entry.last_visible, entry.page_number))
            .collect();
        candidates.sort_unstable();

        let mut evicted = Vec::new();
        for (_, page) in candidates.into_iter().take(rendered - limit) {
            self.release(page);
            evicted.push(page);
        }
        if !evicted.is_empty() {
            debug!(?evicted, limit, "evicted rendered pages");
        }
        evicted
    }
}

pub(crate) fn same_scale(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-4
}
