use std::ops::RangeInclusive;

use tracing::trace;

use crate::layout::ScrollLayout;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntersectionSample {
    pub page: usize,
    pub ratio: f32,
}

/// Intersection ratios observed at one instant. Batches carry the tick they
/// were issued at; only batches newer than the last applied one take effect.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationBatch {
    pub tick: u64,
    pub samples: Vec<IntersectionSample>,
}

#[derive(Debug, Clone)]
pub struct ViewportState {
    pub current_page: usize,
    pub scroll_top: f32,
    pub viewport_height: f32,
    pub ratios: Vec<IntersectionSample>,
    pub applied_tick: u64,
}

/// Derives the current page from what the scroll container shows.
#[derive(Debug)]
pub struct ViewportTracker {
    state: ViewportState,
    switch_threshold: f32,
    mount_margin_screens: f32,
    issued_tick: u64,
}

impl ViewportTracker {
    pub fn new(switch_threshold: f32, mount_margin_screens: f32) -> Self {
        Self {
            state: ViewportState {
                current_page: 1,
                scroll_top: 0.0,
                viewport_height: 0.0,
                ratios: Vec::new(),
                applied_tick: 0,
            },
            switch_threshold,
            mount_margin_screens,
            issued_tick: 0,
        }
    }

    pub fn state(&self) -> &ViewportState {
        &self.state
    }

    pub fn current_page(&self) -> usize {
        self.state.current_page
    }

    pub fn set_geometry(&mut self, scroll_top: f32, viewport_height: f32) {
        self.state.scroll_top = scroll_top.max(0.0);
        self.state.viewport_height = viewport_height.max(0.0);
    }

    /// Reserves a tick for a batch an external observer is about to deliver.
    pub fn begin_batch(&mut self) -> u64 {
        self.issued_tick += 1;
        self.issued_tick
    }

    /// Measures the eligible pages against the current geometry.
    pub fn sample(
        &mut self,
        layout: &ScrollLayout,
        eligible: impl Fn(usize) -> bool,
    ) -> ObservationBatch {
        let tick = self.begin_batch();
        let top = self.state.scroll_top;
        let height = self.state.viewport_height;
        let samples = layout
            .pages_between(top, top + height)
            .into_iter()
            .flatten()
            .filter(|page| eligible(*page))
            .map(|page| IntersectionSample {
                page,
                ratio: layout.visible_ratio(page, top, height),
            })
            .filter(|sample| sample.ratio > 0.0)
            .collect();
        ObservationBatch { tick, samples }
    }

    /// Applies a batch and returns the new current page if it changed.
    pub fn apply(&mut self, batch: ObservationBatch) -> Option<usize> {
        if batch.tick <= self.state.applied_tick {
            trace!(
                tick = batch.tick,
                applied = self.state.applied_tick,
                "dropping stale observation batch"
            );
            return None;
        }
        self.state.applied_tick = batch.tick;
        let winner = strongest(&batch.samples);
        self.state.ratios = batch.samples;

        let winner = winner?;
        if winner.ratio > self.switch_threshold && winner.page != self.state.current_page {
            trace!(page = winner.page, ratio = winner.ratio, "current page changed");
            self.state.current_page = winner.page;
            return Some(winner.page);
        }
        None
    }

    /// Programmatic scroll. Batches issued before the jump become stale.
    pub fn jump_to(&mut self, page: usize, scroll_top: f32) -> bool {
        self.state.scroll_top = scroll_top.max(0.0);
        self.state.applied_tick = self.begin_batch();
        self.state.ratios.clear();
        let changed = self.state.current_page != page;
        self.state.current_page = page;
        changed
    }

    /// Pages that should be mounted so scrolling a few screens in either
    /// direction never waits on rendering.
    pub fn mount_window(&self, layout: &ScrollLayout) -> Option<RangeInclusive<usize>> {
        let height = self.state.viewport_height;
        let margin = height * self.mount_margin_screens;
        let top = self.state.scroll_top;
        layout.pages_between(top - margin, top + height + margin)
    }

    /// Pages intersecting the visible area itself.
    pub fn visible_pages(&self, layout: &ScrollLayout) -> Option<RangeInclusive<usize>> {
        let top = self.state.scroll_top;
        layout.pages_between(top, top + self.state.viewport_height)
    }
}

fn strongest(samples: &[IntersectionSample]) -> Option<IntersectionSample> {
    samples.iter().copied().fold(None, |best, sample| match best {
        Some(best)
            if best.ratio > sample.ratio
                || (best.ratio == sample.ratio && best.page < sample.page) =>
        {
            Some(best)
        }
        _ => Some(sample),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::PageSize;

    fn batch(tracker: &mut ViewportTracker, samples: &[(usize, f32)]) -> ObservationBatch {
        ObservationBatch {
            tick: tracker.begin_batch(),
            samples: samples
                .iter()
                .map(|&(page, ratio)| IntersectionSample { page, ratio })
                .collect(),
        }
    }

    #[test]
    fn switches_to_page_above_threshold() {
        let mut tracker = ViewportTracker::new(0.25, 3.0);
        let batch = batch(&mut tracker, &[(1, 0.2), (2, 0.4)]);
        assert_eq!(tracker.apply(batch), Some(2));
        assert_eq!(tracker.current_page(), 2);
    }

    #[test]
    fn stays_put_when_no_page_clears_threshold() {
        let mut tracker = ViewportTracker::new(0.25, 3.0);
        let batch = batch(&mut tracker, &[(3, 0.2), (4, 0.24)]);
        assert_eq!(tracker.apply(batch), None);
        assert_eq!(tracker.current_page(), 1);
    }

    #[test]
    fn same_winner_is_not_reported_twice() {
        let mut tracker = ViewportTracker::new(0.25, 3.0);
        let first = batch(&mut tracker, &[(2, 0.9)]);
        assert_eq!(tracker.apply(first), Some(2));
        let second = batch(&mut tracker, &[(2, 0.8), (3, 0.2)]);
        assert_eq!(tracker.apply(second), None);
    }

    #[test]
    fn stale_batches_are_ignored() {
        let mut tracker = ViewportTracker::new(0.25, 3.0);
        let older = batch(&mut tracker, &[(5, 1.0)]);
        let newer = batch(&mut tracker, &[(7, 1.0)]);
        assert_eq!(tracker.apply(newer), Some(7));
        assert_eq!(tracker.apply(older), None);
        assert_eq!(tracker.current_page(), 7);
    }

    #[test]
    fn jump_invalidates_batches_issued_before_it() {
        let mut tracker = ViewportTracker::new(0.25, 3.0);
        let before = batch(&mut tracker, &[(10, 1.0)]);
        assert!(tracker.jump_to(200, 5000.0));
        assert_eq!(tracker.apply(before), None);
        assert_eq!(tracker.current_page(), 200);
    }

    #[test]
    fn ties_prefer_the_earlier_page() {
        let mut tracker = ViewportTracker::new(0.25, 3.0);
        let batch = batch(&mut tracker, &[(4, 0.5), (3, 0.5)]);
        assert_eq!(tracker.apply(batch), Some(3));
    }

    #[test]
    fn sample_measures_only_eligible_pages() {
        let layout = ScrollLayout::build(&[PageSize::new(100.0, 100.0); 10], 1.0, 0.0);
        let mut tracker = ViewportTracker::new(0.25, 1.0);
        tracker.set_geometry(150.0, 100.0);

        let batch = tracker.sample(&layout, |page| page != 3);
        assert_eq!(batch.samples, vec![IntersectionSample { page: 2, ratio: 0.5 }]);

        let batch = tracker.sample(&layout, |_| true);
        assert_eq!(batch.samples.len(), 2);
        assert_eq!(tracker.apply(batch), Some(2));
    }

    #[test]
    fn mount_window_spans_margin_screens() {
        let layout = ScrollLayout::build(&[PageSize::new(100.0, 100.0); 20], 1.0, 0.0);
        let mut tracker = ViewportTracker::new(0.25, 2.0);
        tracker.set_geometry(1000.0, 100.0);
        // Visible: 1000..1100; margin of 200 on each side.
        assert_eq!(tracker.mount_window(&layout), Some(8..=14));
        assert_eq!(tracker.visible_pages(&layout), Some(10..=12));
    }
}
