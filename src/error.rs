use thiserror::Error;

/// Reasons an extraction is rejected before any geocoding traffic is issued.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExtractError {
    #[error("Selected area is too large ({area_km2:.2} km²). Please select an area smaller than {max_km2} km².")]
    AreaTooLarge { area_km2: f64, max_km2: f64 },

    #[error("Too many points ({count}). Please select a smaller area or increase grid size.")]
    TooManyPoints { count: usize, max: usize },

    #[error("Coordinates out of valid range: lat {lat}, lon {lon}")]
    InvalidCoordinates { lat: f64, lon: f64 },

    #[error("A polygon needs at least 3 distinct vertices, got {count}")]
    TooFewVertices { count: usize },

    #[error("Grid spacing {spacing} is outside the allowed range [{min}, {max}]")]
    SpacingOutOfRange { spacing: f64, min: f64, max: f64 },

    #[error("Unsupported shape type '{0}'. Please draw a polygon or rectangle.")]
    UnsupportedShape(String),

    #[error("Rate limit exceeded. Please wait {remaining_minutes:.1} minutes before trying again.")]
    RateLimited { remaining_minutes: f64 },
}

impl ExtractError {
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Failure of a single call to the geocoding provider.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    #[error("geocoding request timed out")]
    Timeout,

    #[error("geocoding service error: {0}")]
    Service(String),

    #[error("geocoding request failed: {0}")]
    Other(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Service(_))
    }
}

/// Why a single sample point produced no address.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FailureKind {
    #[error("coordinates out of valid range: lat {lat}, lon {lon}")]
    InvalidCoordinates { lat: f64, lon: f64 },

    #[error("no address at this location")]
    NotFound,

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ProviderError },

    #[error("non-retryable failure: {0}")]
    Permanent(ProviderError),
}
