use crate::config::GeocoderConfig;
use crate::error::ProviderError;
use crate::types::GeocodeResult;
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// A forward-search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Place {
    pub lat: f64,
    pub lon: f64,
    pub address: String,
}

/// A geocoding provider. One call per invocation: no retries, no caching.
pub trait Geocoder: Send + Sync {
    /// Resolves a coordinate to an address; `Ok(None)` when the provider has
    /// nothing at that location.
    fn reverse(&self, lat: f64, lon: f64) -> Result<Option<GeocodeResult>, ProviderError>;

    /// Resolves free text to the best matching place.
    fn search(&self, query: &str) -> Result<Option<Place>, ProviderError>;
}

/// OpenStreetMap Nominatim over HTTP.
#[derive(Debug, Clone)]
pub struct Nominatim {
    base_url: String,
    user_agent: String,
    language: String,
    zoom: u8,
    timeout: Duration,
    client: OnceLock<Client>,
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
    address: Option<AddressParts>,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AddressParts {
    postcode: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    state: Option<String>,
    country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
    display_name: String,
}

impl Nominatim {
    pub fn new(config: &GeocoderConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_agent: config.user_agent.clone(),
            language: config.language.clone(),
            zoom: config.zoom,
            timeout: config.timeout(),
            client: OnceLock::new(),
        }
    }

    // Built on first use, which happens on a blocking thread; the blocking
    // client panics if constructed inside the async runtime.
    fn client(&self) -> Result<&Client, ProviderError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = Client::builder()
            .user_agent(self.user_agent.as_str())
            .timeout(self.timeout)
            .build()
            .map_err(|e| ProviderError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(self.client.get_or_init(|| client))
    }

    fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Response, ProviderError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client()?
            .get(&url)
            .query(query)
            .send()
            .map_err(classify_transport)?;
        check_status(response.status())?;
        Ok(response)
    }
}

impl Geocoder for Nominatim {
    #[instrument(skip(self))]
    fn reverse(&self, lat: f64, lon: f64) -> Result<Option<GeocodeResult>, ProviderError> {
        let response = self.get(
            "reverse",
            &[
                ("format", "jsonv2".to_string()),
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("zoom", self.zoom.to_string()),
                ("accept-language", self.language.clone()),
                ("addressdetails", "1".to_string()),
            ],
        )?;
        let body: ReverseResponse = response
            .json()
            .map_err(|e| ProviderError::Other(format!("failed to parse reverse geocoding response: {e}")))?;
        Ok(into_result(body))
    }

    #[instrument(skip(self))]
    fn search(&self, query: &str) -> Result<Option<Place>, ProviderError> {
        let response = self.get(
            "search",
            &[
                ("format", "jsonv2".to_string()),
                ("q", query.to_string()),
                ("limit", "1".to_string()),
                ("accept-language", self.language.clone()),
            ],
        )?;
        let hits: Vec<SearchHit> = response
            .json()
            .map_err(|e| ProviderError::Other(format!("failed to parse geocoding response: {e}")))?;

        let Some(hit) = hits.into_iter().next() else {
            debug!("no search results");
            return Ok(None);
        };
        let lat = hit
            .lat
            .parse::<f64>()
            .map_err(|e| ProviderError::Other(format!("invalid lat: {e}")))?;
        let lon = hit
            .lon
            .parse::<f64>()
            .map_err(|e| ProviderError::Other(format!("invalid lon: {e}")))?;
        Ok(Some(Place { lat, lon, address: hit.display_name }))
    }
}

fn into_result(body: ReverseResponse) -> Option<GeocodeResult> {
    if let Some(error) = body.error {
        debug!(%error, "provider returned no address");
        return None;
    }
    let address = body.display_name?;
    let parts = body.address.unwrap_or_default();
    Some(GeocodeResult {
        address,
        postal_code: parts.postcode,
        city: parts.city.or(parts.town).or(parts.village),
        state: parts.state,
        country: parts.country,
    })
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else if err.is_connect() {
        ProviderError::Service(err.to_string())
    } else {
        ProviderError::Other(err.to_string())
    }
}

fn check_status(status: StatusCode) -> Result<(), ProviderError> {
    if status.is_success() {
        return Ok(());
    }
    warn!(%status, "geocoding provider returned an error status");
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Err(ProviderError::Timeout),
        StatusCode::TOO_MANY_REQUESTS => Err(ProviderError::Service(format!("provider returned status {status}"))),
        s if s.is_server_error() => Err(ProviderError::Service(format!("provider returned status {status}"))),
        _ => Err(ProviderError::Other(format!("provider returned status {status}"))),
    }
}
