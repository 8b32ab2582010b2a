// =============================================================================
// CONFIGURATION - Load settings from strata.toml
// =============================================================================
//
// Two layers live here:
// - `Config`: the on-disk file, all sections optional, defaults when missing.
// - `RenderConfig`: the immutable value handed to every renderer component.
//   It is built once (from a `Config` or by hand) and never mutated after.

use anyhow::{Context, Result};
use bitflags::bitflags;
use serde::Deserialize;
use std::path::Path;

bitflags! {
    /// Fixed set of renderer capabilities selected at construction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RenderFeatures: u32 {
        /// Surface + swapchain extensions, required for presentation
        const SWAPCHAIN = 1 << 0;
        /// Acceleration structure and ray tracing pipeline device extensions
        const RAY_TRACING = 1 << 1;
        /// Khronos validation layer plus a debug messenger routed into `log`
        const VALIDATION = 1 << 2;
    }
}

impl Default for RenderFeatures {
    fn default() -> Self {
        RenderFeatures::SWAPCHAIN
    }
}

/// How `flush_render` waits for the next presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquirePolicy {
    /// Infinite timeout: the call blocks until an image is available.
    #[default]
    Blocking,
    /// Zero timeout: a not-ready chain skips the tick without rendering.
    NonBlocking,
}

impl AcquirePolicy {
    pub fn timeout_ns(self) -> u64 {
        match self {
            AcquirePolicy::Blocking => u64::MAX,
            AcquirePolicy::NonBlocking => 0,
        }
    }
}

/// Immutable renderer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    app_name: String,
    features: RenderFeatures,
    acquire: AcquirePolicy,
    clear_color: [f32; 4],
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            app_name: "strata application".to_string(),
            features: RenderFeatures::default(),
            acquire: AcquirePolicy::default(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl RenderConfig {
    pub fn new(features: RenderFeatures) -> Self {
        Self {
            features,
            ..Self::default()
        }
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_acquire_policy(mut self, acquire: AcquirePolicy) -> Self {
        self.acquire = acquire;
        self
    }

    /// Color used by the fallback clear when a composition has no layers
    pub fn with_clear_color(mut self, rgba: [f32; 4]) -> Self {
        self.clear_color = rgba;
        self
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn features(&self) -> RenderFeatures {
        self.features
    }

    pub fn acquire_policy(&self) -> AcquirePolicy {
        self.acquire
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }
}

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "strata".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub swapchain: bool,
    pub ray_tracing: bool,
    pub acquire: AcquirePolicy,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            swapchain: true,
            ray_tracing: false,
            acquire: AcquirePolicy::Blocking,
            clear_color: [0.1, 0.2, 0.8, 1.0],
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            show_fps: true,
        }
    }
}

impl Config {
    pub const DEFAULT_PATH: &'static str = "strata.toml";

    /// Load configuration from file, falling back to defaults on any error
    pub fn load() -> Self {
        Self::load_from_path(Self::DEFAULT_PATH).unwrap_or_else(|e| {
            log::warn!("Failed to load {}: {:#}. Using defaults.", Self::DEFAULT_PATH, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn render_features(&self) -> RenderFeatures {
        let mut features = RenderFeatures::empty();
        features.set(RenderFeatures::SWAPCHAIN, self.graphics.swapchain);
        features.set(RenderFeatures::RAY_TRACING, self.graphics.ray_tracing);
        features.set(RenderFeatures::VALIDATION, self.debug.validation_layers);
        features
    }

    /// Freeze the file settings into the value the renderer consumes
    pub fn render_config(&self) -> RenderConfig {
        RenderConfig::new(self.render_features())
            .with_app_name(self.window.title.clone())
            .with_acquire_policy(self.graphics.acquire)
            .with_clear_color(self.graphics.clear_color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.graphics.acquire, AcquirePolicy::Blocking);
        assert!(config.render_features().contains(RenderFeatures::SWAPCHAIN));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[graphics]\nacquire = \"non_blocking\"\nray_tracing = true\n\n[debug]\nvalidation_layers = false"
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.graphics.acquire, AcquirePolicy::NonBlocking);
        assert_eq!(config.window.title, "strata");
        assert_eq!(
            config.render_features(),
            RenderFeatures::SWAPCHAIN | RenderFeatures::RAY_TRACING
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[graphics]\nacquire = \"sometimes\"").unwrap();
        assert!(Config::load_from_path(file.path()).is_err());
    }

    #[test]
    fn render_config_carries_file_settings() {
        let mut config = Config::default();
        config.window.title = "demo".into();
        config.graphics.clear_color = [1.0, 0.0, 0.0, 1.0];
        config.graphics.acquire = AcquirePolicy::NonBlocking;

        let render = config.render_config();
        assert_eq!(render.app_name(), "demo");
        assert_eq!(render.clear_color(), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(render.acquire_policy().timeout_ns(), 0);
    }

    #[test]
    fn blocking_acquire_never_times_out() {
        assert_eq!(AcquirePolicy::Blocking.timeout_ns(), u64::MAX);
    }
}
