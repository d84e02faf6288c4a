use crate::types::{SamplePoint, SurveyPolygon};

/// Lays a regular lattice over the polygon's bounding box and keeps the points
/// strictly inside it.
///
/// The lattice is anchored at the minimum bound, so the same area always
/// produces the same grid. Rows are swept by latitude, then longitude, and
/// points come out as (lat, lon).
pub fn generate(polygon: &SurveyPolygon, spacing: f64) -> Vec<SamplePoint> {
    let bbox = polygon.bounds();
    let xs = lattice(bbox.min().x, bbox.max().x, spacing);
    let ys = lattice(bbox.min().y, bbox.max().y, spacing);

    let mut points = Vec::new();
    for &lat in &ys {
        for &lon in &xs {
            if polygon.contains(lat, lon) {
                points.push(SamplePoint { lat, lon });
            }
        }
    }

    tracing::debug!(
        columns = xs.len(),
        rows = ys.len(),
        points = points.len(),
        spacing,
        "generated sampling grid"
    );
    points
}

// Half-open [min, max) in `step` increments.
fn lattice(min: f64, max: f64, step: f64) -> Vec<f64> {
    if !(step > 0.0) || !(max > min) {
        return Vec::new();
    }
    let steps = ((max - min) / step).ceil() as usize;
    (0..steps).map(|i| min + i as f64 * step).collect()
}
