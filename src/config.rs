use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use anyhow::{bail, Context, Result};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub limits: LimitsConfig,
    pub cache: CacheConfig,
    pub geocoder: GeocoderConfig,
    pub grid: GridConfig,
    pub server: ServerConfig,
}

/// Ceilings applied before any geocoding traffic is issued for a batch.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_area_km2: f64,
    pub max_points: usize,
    pub cooldown_minutes: u32,
    pub requests_per_period: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_area_km2: 5.0,
            max_points: 1000,
            cooldown_minutes: 5,
            requests_per_period: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub duration_hours: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { duration_hours: 24 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeocoderConfig {
    pub base_url: String,
    pub user_agent: String,
    pub language: String,
    pub zoom: u8,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_retry_delay_secs: f64,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: concat!("PolygonAddressExtractor/", env!("CARGO_PKG_VERSION")).to_string(),
            language: "en".to_string(),
            zoom: 18,
            timeout_secs: 10,
            max_retries: 3,
            initial_retry_delay_secs: 1.0,
        }
    }
}

impl GeocoderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.initial_retry_delay_secs)
    }
}

/// Grid spacing in coordinate degrees.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GridConfig {
    pub min_spacing: f64,
    pub max_spacing: f64,
    pub default_spacing: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            min_spacing: 0.00005,
            max_spacing: 0.001,
            default_spacing: 0.0002,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3000, static_dir: None }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when it exists, otherwise falls back to the built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!(path = ?path, "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        let grid = &self.grid;
        if !(grid.min_spacing > 0.0 && grid.min_spacing < grid.max_spacing) {
            bail!(
                "grid.min_spacing ({}) must be positive and below grid.max_spacing ({})",
                grid.min_spacing, grid.max_spacing
            );
        }
        if grid.default_spacing < grid.min_spacing || grid.default_spacing > grid.max_spacing {
            bail!(
                "grid.default_spacing ({}) must lie within [{}, {}]",
                grid.default_spacing, grid.min_spacing, grid.max_spacing
            );
        }
        if self.limits.max_area_km2 <= 0.0 {
            bail!("limits.max_area_km2 must be positive");
        }
        if self.limits.requests_per_period == 0 {
            bail!("limits.requests_per_period must be at least 1");
        }
        if self.geocoder.max_retries == 0 {
            bail!("geocoder.max_retries must be at least 1");
        }
        if !(self.geocoder.initial_retry_delay_secs >= 0.0 && self.geocoder.initial_retry_delay_secs.is_finite()) {
            bail!("geocoder.initial_retry_delay_secs must be a non-negative number");
        }
        Ok(())
    }
}
