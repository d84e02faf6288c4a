use crate::cache::GeocodeCache;
use crate::clock::Sleeper;
use crate::config::GeocoderConfig;
use crate::error::FailureKind;
use crate::error::ProviderError;
use crate::geocoder::{Geocoder, Place};
use crate::types::{valid_coordinates, GeocodeResult};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl RetryPolicy {
    /// Pause before attempt `attempt` (zero-based): `initial_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl From<&GeocoderConfig> for RetryPolicy {
    fn from(config: &GeocoderConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_retry_delay(),
        }
    }
}

/// Reverse geocoding with cache read-through and a fixed backoff schedule.
///
/// Every provider call is preceded by a sleep, first attempt included, so the
/// client never exceeds the provider's usage policy regardless of outcome.
/// Calls from every session sharing the client go through one gate: at most
/// one request is in flight, and the pre-call sleep happens while holding it.
pub struct RetryingGeocodeClient {
    provider: Arc<dyn Geocoder>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
    gate: Mutex<()>,
}

impl RetryingGeocodeClient {
    pub fn new(provider: Arc<dyn Geocoder>, sleeper: Arc<dyn Sleeper>, policy: RetryPolicy) -> Self {
        Self { provider, sleeper, policy, gate: Mutex::new(()) }
    }

    /// Forward search through the same gate as reverse lookups. Not retried.
    pub fn search(&self, query: &str) -> Result<Option<Place>, ProviderError> {
        let _turn = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.provider.search(query)
    }

    pub fn reverse_geocode(
        &self,
        cache: &mut GeocodeCache,
        lat: f64,
        lon: f64,
    ) -> Result<GeocodeResult, FailureKind> {
        if !valid_coordinates(lat, lon) {
            return Err(FailureKind::InvalidCoordinates { lat, lon });
        }

        if let Some(hit) = cache.get(lat, lon) {
            debug!(lat, lon, "cache hit");
            return Ok(hit.clone());
        }

        let mut attempt = 0;
        loop {
            let outcome = {
                let _turn = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
                self.sleeper.sleep(self.policy.delay_for(attempt));
                self.provider.reverse(lat, lon)
            };

            match outcome {
                Ok(Some(result)) => {
                    cache.put(lat, lon, result.clone());
                    return Ok(result);
                }
                Ok(None) => return Err(FailureKind::NotFound),
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    if attempt >= self.policy.max_retries {
                        warn!(lat, lon, attempts = attempt, error = %err, "giving up on point");
                        return Err(FailureKind::Exhausted { attempts: attempt, last: err });
                    }
                    debug!(lat, lon, attempt, error = %err, "retrying");
                }
                Err(err) => {
                    debug!(lat, lon, error = %err, "non-retryable provider failure");
                    return Err(FailureKind::Permanent(err));
                }
            }
        }
    }
}
