use crate::cache::GeocodeCache;
use crate::clock::Clock;
use crate::config::{AppConfig, GridConfig};
use crate::error::{ExtractError, FailureKind};
use crate::grid;
use crate::quota::{QuotaGuard, QuotaState};
use crate::retry::RetryingGeocodeClient;
use crate::types::{AddressRecord, SamplePoint, SurveyPolygon};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, info, info_span};

/// Mutable per-user state shared by consecutive extraction runs.
#[derive(Debug, Clone)]
pub struct Session {
    pub quota: QuotaState,
    pub cache: GeocodeCache,
}

impl Session {
    pub fn new(config: &AppConfig, now: DateTime<Utc>) -> Self {
        Self {
            quota: QuotaState::default(),
            cache: GeocodeCache::with_hours(config.cache.duration_hours, now),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.processed as f64 / self.total as f64
        }
    }
}

/// Points that passed every pre-flight check and were charged to the quota.
#[derive(Debug, Clone)]
pub struct Batch {
    points: Vec<SamplePoint>,
    area_km2: f64,
}

impl Batch {
    pub fn points(&self) -> &[SamplePoint] {
        &self.points
    }

    pub fn area_km2(&self) -> f64 {
        self.area_km2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    NoPointsGenerated,
    NoAddressesFound,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureTally {
    pub not_found: usize,
    pub exhausted: usize,
    pub permanent: usize,
    pub invalid: usize,
}

impl FailureTally {
    fn record(&mut self, kind: &FailureKind) {
        match kind {
            FailureKind::NotFound => self.not_found += 1,
            FailureKind::Exhausted { .. } => self.exhausted += 1,
            FailureKind::Permanent(_) => self.permanent += 1,
            FailureKind::InvalidCoordinates { .. } => self.invalid += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.not_found + self.exhausted + self.permanent + self.invalid
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub outcome: Outcome,
    pub area_km2: f64,
    pub total_points: usize,
    pub processed: usize,
    pub records: Vec<AddressRecord>,
    pub failures: FailureTally,
}

/// Polygon → grid → quota → geocode → deduplicated address table.
pub struct ExtractionPipeline {
    guard: QuotaGuard,
    grid: GridConfig,
    client: RetryingGeocodeClient,
    clock: Arc<dyn Clock>,
}

impl ExtractionPipeline {
    pub fn new(config: &AppConfig, client: RetryingGeocodeClient, clock: Arc<dyn Clock>) -> Self {
        Self {
            guard: QuotaGuard::new(config.limits.clone()),
            grid: config.grid.clone(),
            client,
            clock,
        }
    }

    pub fn client(&self) -> &RetryingGeocodeClient {
        &self.client
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn extract(
        &self,
        session: &mut Session,
        polygon: &SurveyPolygon,
        spacing: f64,
        on_progress: &mut dyn FnMut(Progress) -> ControlFlow<()>,
    ) -> Result<ExtractionReport, ExtractError> {
        let batch = self.prepare(session, polygon, spacing)?;
        Ok(self.run(session, batch, on_progress))
    }

    /// Validation, gridding and quota checks. On success the batch has been
    /// counted against the session's rate limit, unless it holds no points.
    pub fn prepare(
        &self,
        session: &mut Session,
        polygon: &SurveyPolygon,
        spacing: f64,
    ) -> Result<Batch, ExtractError> {
        let now = self.clock.now();
        session.cache.evict_if_stale(now);

        let (min, max) = (self.grid.min_spacing, self.grid.max_spacing);
        if !(spacing >= min && spacing <= max) {
            return Err(ExtractError::SpacingOutOfRange { spacing, min, max });
        }
        let area_km2 = self.guard.check_area(polygon)?;

        let points = grid::generate(polygon, spacing);
        if points.is_empty() {
            info!(area_km2, spacing, "no points generated");
            return Ok(Batch { points, area_km2 });
        }

        self.guard.check_point_count(&points)?;
        self.guard.enforce_rate_limit(&mut session.quota, now)?;
        session.quota.record_request(now);

        info!(
            area_km2,
            points = points.len(),
            requests_in_window = session.quota.request_count,
            "extraction accepted"
        );
        Ok(Batch { points, area_km2 })
    }

    /// Geocodes every point in grid order. Per-point failures are tallied and
    /// skipped; returning `Break` from `on_progress` stops further dispatch.
    pub fn run(
        &self,
        session: &mut Session,
        batch: Batch,
        on_progress: &mut dyn FnMut(Progress) -> ControlFlow<()>,
    ) -> ExtractionReport {
        let total = batch.points.len();
        let span = info_span!("extraction", total);
        let _enter = span.enter();

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut failures = FailureTally::default();
        let mut processed = 0;
        let mut stopped = false;

        for point in &batch.points {
            match self.client.reverse_geocode(&mut session.cache, point.lat, point.lon) {
                Ok(result) => {
                    if seen.insert(result.address.clone()) {
                        records.push(AddressRecord::new(*point, &result));
                    }
                }
                Err(kind) => {
                    debug!(lat = point.lat, lon = point.lon, reason = %kind, "skipping point");
                    failures.record(&kind);
                }
            }
            processed += 1;

            if on_progress(Progress { processed, total }).is_break() {
                // a stop requested after the last point changes nothing
                stopped = processed < total;
                if stopped {
                    info!(processed, total, "extraction stopped by caller");
                }
                break;
            }
        }

        let outcome = if total == 0 {
            Outcome::NoPointsGenerated
        } else if stopped {
            Outcome::Stopped
        } else if records.is_empty() {
            Outcome::NoAddressesFound
        } else {
            Outcome::Completed
        };

        info!(
            ?outcome,
            addresses = records.len(),
            failed = failures.total(),
            cached = session.cache.len(),
            "extraction finished"
        );

        ExtractionReport {
            outcome,
            area_km2: batch.area_km2,
            total_points: total,
            processed,
            records,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::{ManualClock, RecordingSleeper};
    use crate::error::ProviderError;
    use crate::retry::testing::{result, FakeGeocoder};
    use crate::retry::RetryPolicy;
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;

    struct Harness {
        pipeline: ExtractionPipeline,
        provider: Arc<FakeGeocoder>,
        sleeper: Arc<RecordingSleeper>,
        clock: Arc<ManualClock>,
        session: Session,
    }

    fn harness(provider: FakeGeocoder) -> Harness {
        let config = AppConfig::default();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let provider = Arc::new(provider);
        let sleeper = Arc::new(RecordingSleeper::default());
        let clock = Arc::new(ManualClock::new(start));
        let client = RetryingGeocodeClient::new(
            provider.clone(),
            sleeper.clone(),
            RetryPolicy { max_retries: 3, initial_delay: StdDuration::from_secs(1) },
        );
        Harness {
            pipeline: ExtractionPipeline::new(&config, client, clock.clone()),
            provider,
            sleeper,
            clock,
            session: Session::new(&config, start),
        }
    }

    fn square() -> SurveyPolygon {
        SurveyPolygon::from_lon_lat(&[
            [-96.8900, 33.1480],
            [-96.8850, 33.1480],
            [-96.8850, 33.1450],
            [-96.8900, 33.1450],
        ])
        .unwrap()
    }

    fn keep_going(_: Progress) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn street_for(lat: f64, _lon: f64) -> Result<Option<crate::types::GeocodeResult>, ProviderError> {
        // one street per grid row
        Ok(Some(result(&format!("{:.4} Row St", lat))))
    }

    #[test]
    fn same_address_produces_one_record() {
        let mut h = harness(FakeGeocoder::responding(|_, _| Ok(Some(result("1 Only Way")))));
        let report = h.pipeline.extract(&mut h.session, &square(), 0.001, &mut keep_going).unwrap();

        assert!(report.total_points > 1);
        assert_eq!(h.provider.calls(), report.total_points);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].address, "1 Only Way");
        assert_eq!(report.outcome, Outcome::Completed);

        let first = grid::generate(&square(), 0.001)[0];
        assert_eq!(report.records[0].latitude, first.lat);
        assert_eq!(report.records[0].longitude, first.lon);
    }

    #[test]
    fn records_follow_grid_order_and_progress_is_monotonic() {
        let mut h = harness(FakeGeocoder::responding(street_for));
        let mut seen = Vec::new();
        let report = h
            .pipeline
            .extract(&mut h.session, &square(), 0.0005, &mut |p: Progress| {
                seen.push(p);
                ControlFlow::Continue(())
            })
            .unwrap();

        let total = report.total_points;
        assert_eq!(seen.len(), total);
        for (i, p) in seen.iter().enumerate() {
            assert_eq!(*p, Progress { processed: i + 1, total });
        }
        assert_eq!(seen.last().map(Progress::fraction), Some(1.0));

        let lats: Vec<f64> = report.records.iter().map(|r| r.latitude).collect();
        assert!(lats.windows(2).all(|w| w[0] < w[1]));
        assert!(report.records.len() > 1);
    }

    #[test]
    fn failed_points_are_skipped_not_fatal() {
        let mut h = harness(FakeGeocoder::scripted(vec![
            Err(ProviderError::Other("boom".into())),
            Ok(None),
            Ok(Some(result("7 Pine Ct"))),
        ]));
        let report = h.pipeline.extract(&mut h.session, &square(), 0.001, &mut keep_going).unwrap();

        assert_eq!(report.processed, report.total_points);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].address, "7 Pine Ct");
        assert_eq!(report.failures.permanent, 1);
        assert!(report.failures.not_found >= 1);
        assert_eq!(report.failures.total() + 1, report.total_points);
    }

    #[test]
    fn no_addresses_is_an_outcome_not_an_error() {
        let mut h = harness(FakeGeocoder::scripted(vec![]));
        let report = h.pipeline.extract(&mut h.session, &square(), 0.001, &mut keep_going).unwrap();
        assert_eq!(report.outcome, Outcome::NoAddressesFound);
        assert!(report.records.is_empty());
    }

    #[test]
    fn spacing_wider_than_area_reports_no_points_without_charging_quota() {
        let mut h = harness(FakeGeocoder::scripted(vec![]));
        let polygon = SurveyPolygon::from_lon_lat(&[[0.0, 0.0], [0.0008, 0.0], [0.0008, 0.0008], [0.0, 0.0008]]).unwrap();
        let report = h.pipeline.extract(&mut h.session, &polygon, 0.001, &mut keep_going).unwrap();
        assert_eq!(report.outcome, Outcome::NoPointsGenerated);
        assert_eq!(report.total_points, 0);
        assert_eq!(h.session.quota.request_count, 0);
        assert_eq!(h.provider.calls(), 0);
    }

    #[test]
    fn stopping_keeps_accumulated_records() {
        let mut h = harness(FakeGeocoder::responding(street_for));
        let report = h
            .pipeline
            .extract(&mut h.session, &square(), 0.0005, &mut |p: Progress| {
                if p.processed == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(report.outcome, Outcome::Stopped);
        assert_eq!(report.processed, 3);
        assert_eq!(h.provider.calls(), 3);
        assert!(!report.records.is_empty());
    }

    #[test]
    fn stop_on_final_point_still_completes() {
        let mut h = harness(FakeGeocoder::responding(street_for));
        let report = h
            .pipeline
            .extract(&mut h.session, &square(), 0.001, &mut |p: Progress| {
                if p.processed == p.total {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(report.processed, report.total_points);
        assert_eq!(report.outcome, Outcome::Completed);
    }

    #[test]
    fn rejections_happen_before_any_provider_traffic() {
        let mut h = harness(FakeGeocoder::scripted(vec![]));

        let big = SurveyPolygon::from_lon_lat(&[[0.0, 0.0], [0.05, 0.0], [0.05, 0.05], [0.0, 0.05]]).unwrap();
        assert!(matches!(
            h.pipeline.prepare(&mut h.session, &big, 0.001),
            Err(ExtractError::AreaTooLarge { .. })
        ));

        // 0.02 x 0.02 deg is ~4.9 km², but at the finest spacing yields far more than 1000 points
        let dense = SurveyPolygon::from_lon_lat(&[[0.0, 0.0], [0.02, 0.0], [0.02, 0.02], [0.0, 0.02]]).unwrap();
        assert!(matches!(
            h.pipeline.prepare(&mut h.session, &dense, 0.00005),
            Err(ExtractError::TooManyPoints { .. })
        ));

        assert_eq!(
            h.pipeline.prepare(&mut h.session, &square(), 0.01).unwrap_err(),
            ExtractError::SpacingOutOfRange { spacing: 0.01, min: 0.00005, max: 0.001 }
        );

        assert_eq!(h.session.quota.request_count, 0);
        assert_eq!(h.provider.calls(), 0);
        assert!(h.sleeper.delays().is_empty());
    }

    #[test]
    fn fourth_batch_in_window_is_rate_limited() {
        let mut h = harness(FakeGeocoder::responding(|_, _| Ok(Some(result("1 Main St")))));
        for _ in 0..3 {
            h.pipeline.prepare(&mut h.session, &square(), 0.001).unwrap();
            h.clock.advance(Duration::minutes(1));
        }
        match h.pipeline.prepare(&mut h.session, &square(), 0.001) {
            Err(ExtractError::RateLimited { remaining_minutes }) => {
                assert!((remaining_minutes - 4.0).abs() < 1e-9);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        h.clock.advance(Duration::minutes(5));
        assert!(h.pipeline.prepare(&mut h.session, &square(), 0.001).is_ok());
        assert_eq!(h.session.quota.request_count, 1);
    }

    #[test]
    fn second_run_is_served_from_cache() {
        let mut h = harness(FakeGeocoder::responding(street_for));
        let first = h.pipeline.extract(&mut h.session, &square(), 0.001, &mut keep_going).unwrap();
        let calls = h.provider.calls();
        let delays = h.sleeper.delays().len();

        let second = h.pipeline.extract(&mut h.session, &square(), 0.001, &mut keep_going).unwrap();
        assert_eq!(h.provider.calls(), calls);
        assert_eq!(h.sleeper.delays().len(), delays);
        assert_eq!(first.records, second.records);
    }

    #[test]
    fn stale_cache_is_dropped_at_the_start_of_a_run() {
        let mut h = harness(FakeGeocoder::responding(street_for));
        h.pipeline.extract(&mut h.session, &square(), 0.001, &mut keep_going).unwrap();
        let calls = h.provider.calls();
        assert!(!h.session.cache.is_empty());

        h.clock.advance(Duration::hours(25));
        h.pipeline.extract(&mut h.session, &square(), 0.001, &mut keep_going).unwrap();
        assert_eq!(h.provider.calls(), calls * 2);
    }
}
