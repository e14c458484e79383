use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub initial_scale: f32,
    pub min_scale: f32,
    pub max_scale: f32,
    pub zoom_step: f32,
    /// Vertical space between stacked pages, in layout units.
    pub page_gap: f32,
    /// Minimum intersection ratio a page must exceed to become current.
    pub switch_threshold: f32,
    /// Pages within this many container heights above or below the visible
    /// area are mounted ahead of time.
    pub mount_margin_screens: f32,
    /// Largest distance covered by one step of a long jump.
    pub chunk_size: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub chunk_yield: Duration,
    /// When set, rendered pages beyond this count are released, least
    /// recently visible first. Unset keeps every rendered page.
    pub max_rendered_pages: Option<usize>,
    pub narration: NarrationConfig,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            initial_scale: 1.5,
            min_scale: 0.5,
            max_scale: 2.0,
            zoom_step: 0.1,
            page_gap: 10.0,
            switch_threshold: 0.25,
            mount_margin_screens: 3.0,
            chunk_size: 50,
            chunk_yield: Duration::from_millis(10),
            max_rendered_pages: None,
            narration: NarrationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrationConfig {
    pub chars_per_second: f32,
    /// Vertical distance, in points, within which runs share a line.
    pub line_tolerance: f32,
    pub default_speed: f32,
    pub min_speed: f32,
    pub max_speed: f32,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            chars_per_second: 15.0,
            line_tolerance: 2.0,
            default_speed: 1.0,
            min_speed: 0.5,
            max_speed: 2.0,
        }
    }
}

impl NarrationConfig {
    pub fn clamp_speed(&self, speed: f32) -> f32 {
        if !speed.is_finite() {
            return self.default_speed;
        }
        speed.clamp(self.min_speed, self.max_speed)
    }
}

impl ViewerConfig {
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("net", "folio", "folio")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("invalid config file {:?}", path))?;
        Ok(config)
    }

    /// Loads `explicit` if given, else the platform config file if present,
    /// else the defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.min_scale > 0.0 && self.min_scale <= self.max_scale) {
            bail!(
                "scale range {}..={} is empty or not positive",
                self.min_scale,
                self.max_scale
            );
        }
        if self.initial_scale < self.min_scale || self.initial_scale > self.max_scale {
            bail!(
                "initial_scale {} lies outside {}..={}",
                self.initial_scale,
                self.min_scale,
                self.max_scale
            );
        }
        if self.zoom_step <= 0.0 {
            bail!("zoom_step must be positive");
        }
        if self.page_gap < 0.0 {
            bail!("page_gap must not be negative");
        }
        if !(0.0..1.0).contains(&self.switch_threshold) {
            bail!("switch_threshold must lie in [0, 1)");
        }
        if self.mount_margin_screens < 0.0 {
            bail!("mount_margin_screens must not be negative");
        }
        if self.chunk_size == 0 {
            bail!("chunk_size must be at least 1");
        }
        if self.max_rendered_pages == Some(0) {
            bail!("max_rendered_pages must be at least 1 when set");
        }
        let narration = &self.narration;
        if narration.chars_per_second <= 0.0 {
            bail!("narration.chars_per_second must be positive");
        }
        if narration.line_tolerance < 0.0 {
            bail!("narration.line_tolerance must not be negative");
        }
        if !(narration.min_speed > 0.0 && narration.min_speed <= narration.max_speed) {
            bail!("narration speed range is empty or not positive");
        }
        Ok(())
    }

    pub fn clamp_scale(&self, scale: f32) -> f32 {
        if !scale.is_finite() {
            return self.initial_scale;
        }
        scale.clamp(self.min_scale, self.max_scale)
    }
}
