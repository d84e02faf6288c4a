use crate::config::LimitsConfig;
use crate::error::ExtractError;
use crate::types::{SamplePoint, SurveyPolygon};
use chrono::{DateTime, Duration, Utc};

/// Kilometres per degree used by the area estimate.
pub const KM_PER_DEGREE: f64 = 111.0;

/// Request bookkeeping for one session's sliding cooldown window.
#[derive(Debug, Clone, Default)]
pub struct QuotaState {
    pub last_request: Option<DateTime<Utc>>,
    pub request_count: u32,
}

impl QuotaState {
    /// Counts one accepted batch against the current window.
    pub fn record_request(&mut self, now: DateTime<Utc>) {
        self.request_count += 1;
        self.last_request = Some(now);
    }
}

#[derive(Debug, Clone)]
pub struct QuotaGuard {
    limits: LimitsConfig,
}

impl QuotaGuard {
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    /// Bounding-box area in km², treating one degree as 111 km on both axes.
    ///
    /// This over-approximates the true area of any non-rectangular polygon and
    /// ignores the shrinking of longitude degrees away from the equator. It is
    /// a conservative ceiling check, not a geodesic area.
    pub fn check_area(&self, polygon: &SurveyPolygon) -> Result<f64, ExtractError> {
        let area_km2 = bounding_area_km2(polygon);
        if area_km2 > self.limits.max_area_km2 {
            return Err(ExtractError::AreaTooLarge {
                area_km2,
                max_km2: self.limits.max_area_km2,
            });
        }
        Ok(area_km2)
    }

    pub fn check_point_count(&self, points: &[SamplePoint]) -> Result<usize, ExtractError> {
        let count = points.len();
        if count > self.limits.max_points {
            return Err(ExtractError::TooManyPoints { count, max: self.limits.max_points });
        }
        Ok(count)
    }

    /// Returns whether a new batch may start. Opens a fresh window when the
    /// previous one has expired; the caller records the request once accepted.
    pub fn check_rate_limit(&self, state: &mut QuotaState, now: DateTime<Utc>) -> bool {
        let expired = match state.last_request {
            Some(last) => now - last > self.cooldown(),
            None => true,
        };
        if expired {
            state.request_count = 0;
            state.last_request = Some(now);
            return true;
        }
        state.request_count < self.limits.requests_per_period
    }

    /// Minutes left before the current window expires.
    pub fn remaining_minutes(&self, state: &QuotaState, now: DateTime<Utc>) -> f64 {
        let Some(last) = state.last_request else {
            return 0.0;
        };
        let elapsed_minutes = (now - last).num_milliseconds() as f64 / 60_000.0;
        (self.limits.cooldown_minutes as f64 - elapsed_minutes).max(0.0)
    }

    /// Rate-limit check that converts a denial into a user-facing error.
    pub fn enforce_rate_limit(&self, state: &mut QuotaState, now: DateTime<Utc>) -> Result<(), ExtractError> {
        if self.check_rate_limit(state, now) {
            Ok(())
        } else {
            Err(ExtractError::RateLimited {
                remaining_minutes: self.remaining_minutes(state, now),
            })
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::minutes(i64::from(self.limits.cooldown_minutes))
    }
}

pub fn bounding_area_km2(polygon: &SurveyPolygon) -> f64 {
    let bbox = polygon.bounds();
    let width = (bbox.max().x - bbox.min().x).abs() * KM_PER_DEGREE;
    let height = (bbox.max().y - bbox.min().y).abs() * KM_PER_DEGREE;
    width * height
}
