use std::ops::RangeInclusive;

use crate::document::PageSize;

/// Vertical stack of page boxes at one scale, as laid out in the scroll
/// container.
#[derive(Debug, Clone)]
pub struct ScrollLayout {
    tops: Vec<f32>,
    bottoms: Vec<f32>,
    total_height: f32,
}

impl ScrollLayout {
    pub fn build(sizes: &[PageSize], scale: f32, gap: f32) -> Self {
        let mut tops = Vec::with_capacity(sizes.len());
        let mut bottoms = Vec::with_capacity(sizes.len());
        let mut cursor = 0.0_f32;
        for (idx, size) in sizes.iter().enumerate() {
            if idx > 0 {
                cursor += gap;
            }
            let height = size.viewport(scale).height;
            tops.push(cursor);
            cursor += height;
            bottoms.push(cursor);
        }
        Self {
            tops,
            bottoms,
            total_height: cursor,
        }
    }

    pub fn page_count(&self) -> usize {
        self.tops.len()
    }

    pub fn total_height(&self) -> f32 {
        self.total_height
    }

    pub fn page_top(&self, page: usize) -> Option<f32> {
        page.checked_sub(1).and_then(|idx| self.tops.get(idx).copied())
    }

    /// `(top, bottom)` of a page in container coordinates.
    pub fn page_span(&self, page: usize) -> Option<(f32, f32)> {
        let idx = page.checked_sub(1)?;
        Some((*self.tops.get(idx)?, *self.bottoms.get(idx)?))
    }

    /// Largest valid scroll offset for a container of `viewport_height`.
    pub fn max_scroll(&self, viewport_height: f32) -> f32 {
        (self.total_height - viewport_height).max(0.0)
    }

    /// Pages whose box intersects `[top, bottom]`, or `None` when no page
    /// does.
    pub fn pages_between(&self, top: f32, bottom: f32) -> Option<RangeInclusive<usize>> {
        if self.tops.is_empty() || bottom < top {
            return None;
        }
        // First page whose bottom edge reaches `top`.
        let first = self.bottoms.partition_point(|page_bottom| *page_bottom < top);
        // One past the last page whose top edge is at or above `bottom`.
        let end = self.tops.partition_point(|page_top| *page_top <= bottom);
        if first >= end {
            return None;
        }
        Some((first + 1)..=end)
    }

    /// Fraction of the page's height visible in `[scroll_top, scroll_top + height]`.
    pub fn visible_ratio(&self, page: usize, scroll_top: f32, viewport_height: f32) -> f32 {
        let Some((top, bottom)) = self.page_span(page) else {
            return 0.0;
        };
        let page_height = bottom - top;
        if page_height <= 0.0 {
            return 0.0;
        }
        let visible = (bottom.min(scroll_top + viewport_height) - top.max(scroll_top)).max(0.0);
        (visible / page_height).clamp(0.0, 1.0)
    }
}
