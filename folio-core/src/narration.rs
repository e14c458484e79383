use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::config::NarrationConfig;
use crate::pipeline::{PositionedRun, TextLayer};
use crate::store::RenderedPage;

#[derive(Debug, Clone, PartialEq)]
pub struct NarrationLine {
    pub text: String,
    /// Characters spoken before this line starts.
    pub char_offset: usize,
    pub start: Duration,
}

/// Lines of one page with estimated start offsets.
///
/// Offsets come from a characters-per-second estimate scaled by playback
/// speed, not from the synthesised audio. They drift on long pages and across
/// voices; highlight sync built on them is approximate.
#[derive(Debug, Clone, PartialEq)]
pub struct NarrationLineSequence {
    page_number: usize,
    lines: Vec<NarrationLine>,
    total_chars: usize,
    chars_per_second: f32,
    speed: f32,
}

const FALLBACK_CHARS_PER_SECOND: f32 = 15.0;

/// Rates that are zero, negative or not finite fall back to `fallback`.
fn positive_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback
    }
}

impl NarrationLineSequence {
    fn build(page_number: usize, texts: Vec<String>, chars_per_second: f32, speed: f32) -> Self {
        let chars_per_second = positive_or(chars_per_second, FALLBACK_CHARS_PER_SECOND);
        let speed = positive_or(speed, 1.0);
        let rate = chars_per_second * speed;
        let mut offset = 0usize;
        let lines = texts
            .into_iter()
            .map(|text| {
                let line = NarrationLine {
                    start: Duration::from_secs_f32(offset as f32 / rate),
                    char_offset: offset,
                    text,
                };
                offset += line.text.chars().count();
                line
            })
            .collect();
        Self {
            page_number,
            lines,
            total_chars: offset,
            chars_per_second,
            speed,
        }
    }

    pub fn page_number(&self) -> usize {
        self.page_number
    }

    pub fn lines(&self) -> &[NarrationLine] {
        &self.lines
    }

    pub fn texts(&self) -> Vec<String> {
        self.lines.iter().map(|line| line.text.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs_f32(self.total_chars as f32 / (self.chars_per_second * self.speed))
    }

    /// Index of the line estimated to be spoken `elapsed` into playback.
    pub fn line_at(&self, elapsed: Duration) -> Option<usize> {
        if self.lines.is_empty() || elapsed >= self.estimated_duration() {
            return None;
        }
        let started = self.lines.partition_point(|line| line.start <= elapsed);
        started.checked_sub(1)
    }

    /// Same lines re-timed for another playback speed.
    pub fn with_speed(&self, speed: f32) -> Self {
        Self::build(
            self.page_number,
            self.texts(),
            self.chars_per_second,
            speed,
        )
    }
}

/// Groups a page's positioned text into lines for narration.
#[derive(Debug, Clone)]
pub struct NarrationSegmenter {
    line_tolerance: f32,
    chars_per_second: f32,
}

impl NarrationSegmenter {
    pub fn new(config: &NarrationConfig) -> Self {
        Self {
            line_tolerance: config.line_tolerance,
            chars_per_second: config.chars_per_second,
        }
    }

    pub fn extract_lines(&self, page: &RenderedPage) -> Vec<String> {
        self.group_lines(&page.text_layer)
    }

    /// Runs whose vertical position lies within the tolerance of a line's
    /// first run join that line. Lines read top to bottom, runs left to right.
    pub fn group_lines(&self, layer: &TextLayer) -> Vec<String> {
        let tolerance = self.line_tolerance * layer.scale;
        let mut runs: Vec<&PositionedRun> = layer
            .runs
            .iter()
            .filter(|run| !run.text.trim().is_empty())
            .collect();
        runs.sort_by(|a, b| a.y.total_cmp(&b.y));

        let mut lines: Vec<(f32, Vec<&PositionedRun>)> = Vec::new();
        for run in runs {
            match lines.last_mut() {
                Some((anchor, members)) if (run.y - *anchor).abs() <= tolerance => {
                    members.push(run)
                }
                _ => lines.push((run.y, vec![run])),
            }
        }

        lines
            .into_iter()
            .map(|(_, mut members)| {
                members.sort_by(|a, b| a.x.total_cmp(&b.x));
                members
                    .iter()
                    .flat_map(|run| run.text.split_whitespace())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|line| !line.is_empty())
            .collect()
    }

    pub fn sequence(
        &self,
        page_number: usize,
        lines: Vec<String>,
        speed: f32,
    ) -> NarrationLineSequence {
        NarrationLineSequence::build(page_number, lines, self.chars_per_second, speed)
    }
}

/// What the speech-synthesis collaborator receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NarrationRequest {
    pub page_number: usize,
    pub lines: Vec<String>,
    pub voice_id: String,
    pub speed: f32,
}

#[derive(Debug, Clone)]
pub struct NarrationAudio {
    pub mime_type: String,
    pub bytes: Bytes,
}

#[async_trait]
pub trait NarrationService: Send + Sync {
    async fn synthesize(&self, request: &NarrationRequest) -> Result<NarrationAudio>;
}

/// A running narration. Dies when stopped or when the current page moves.
#[derive(Debug, Clone)]
pub struct NarrationPlayback {
    pub(crate) token: u64,
    pub sequence: NarrationLineSequence,
    pub audio: NarrationAudio,
}

impl NarrationPlayback {
    pub fn page_number(&self) -> usize {
        self.sequence.page_number()
    }

    pub fn highlighted_line(&self, elapsed: Duration) -> Option<&NarrationLine> {
        self.sequence
            .line_at(elapsed)
            .and_then(|idx| self.sequence.lines().get(idx))
    }
}
