use crate::error::ExtractError;
use geo::{BoundingRect, Contains, Coord, LineString, Point, Polygon, Rect};
use serde::{Deserialize, Serialize};

/// An accepted survey area. Vertices are (longitude, latitude); the ring is
/// implicitly closed and never changes after construction.
#[derive(Debug, Clone)]
pub struct SurveyPolygon {
    shape: Polygon<f64>,
    bounds: Rect<f64>,
}

impl SurveyPolygon {
    pub fn from_lon_lat(coords: &[[f64; 2]]) -> Result<Self, ExtractError> {
        if let Some(&[lon, lat]) = coords.iter().find(|&&[lon, lat]| !valid_coordinates(lat, lon)) {
            return Err(ExtractError::InvalidCoordinates { lat, lon });
        }

        let mut distinct: Vec<[f64; 2]> = Vec::with_capacity(coords.len());
        for coord in coords {
            if !distinct.contains(coord) {
                distinct.push(*coord);
            }
        }
        if distinct.len() < 3 {
            return Err(ExtractError::TooFewVertices { count: distinct.len() });
        }

        let ring: LineString<f64> = coords.iter().map(|&[x, y]| Coord { x, y }).collect();
        let shape = Polygon::new(ring, vec![]);
        let bounds = shape
            .bounding_rect()
            .ok_or(ExtractError::TooFewVertices { count: 0 })?;

        Ok(Self { shape, bounds })
    }

    pub fn bounds(&self) -> Rect<f64> {
        self.bounds
    }

    /// Strict containment: points on the boundary are outside.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.shape.contains(&Point::new(lon, lat))
    }
}

pub fn valid_coordinates(lat: f64, lon: f64) -> bool {
    (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// A lattice point strictly inside a [`SurveyPolygon`], in (latitude, longitude) order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplePoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub address: String,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

/// One row of the output table; unique by `address` within a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddressRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
    pub postal_code: String,
    pub city: String,
    pub state: String,
    pub country: String,
}

impl AddressRecord {
    pub fn new(point: SamplePoint, result: &GeocodeResult) -> Self {
        let field = |v: &Option<String>| v.clone().unwrap_or_default();
        Self {
            latitude: point.lat,
            longitude: point.lon,
            address: result.address.clone(),
            postal_code: field(&result.postal_code),
            city: field(&result.city),
            state: field(&result.state),
            country: field(&result.country),
        }
    }
}

/// A polygon read from an input file, before validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedPolygon {
    pub name: String,
    pub coordinates: Vec<[f64; 2]>,
    pub id: String,
}
