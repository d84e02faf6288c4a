use crate::error::ExtractError;
use crate::kml;
use crate::types::{NamedPolygon, SurveyPolygon};
use anyhow::{anyhow, Context, Result};
use geojson::{feature::Id, Feature, GeoJson, Value};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// A shape as exported by a map drawing widget. Only the first ring is used.
#[derive(Debug, Clone, Deserialize)]
pub struct DrawnShape {
    pub geometry: ShapeGeometry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShapeGeometry {
    #[serde(rename = "type")]
    pub kind: String,
    pub coordinates: Vec<Vec<Vec<f64>>>,
}

pub fn polygon_from_shape(shape: &DrawnShape) -> Result<SurveyPolygon, ExtractError> {
    let geometry = &shape.geometry;
    if geometry.kind != "Polygon" && geometry.kind != "Rectangle" {
        return Err(ExtractError::UnsupportedShape(geometry.kind.clone()));
    }
    let ring = geometry
        .coordinates
        .first()
        .map(|ring| positions(ring))
        .unwrap_or_default();
    SurveyPolygon::from_lon_lat(&ring)
}

/// Reads every polygon in a KML or GeoJSON file.
pub fn load_polygons(path: &Path) -> Result<Vec<NamedPolygon>> {
    let extension = path.extension()
        .and_then(|e| e.to_str())
        .map(|s: &str| s.to_lowercase())
        .ok_or_else(|| anyhow!("Input polygon file has no extension"))?;

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read polygon file: {:?}", path))?;

    let polygons = match extension.as_str() {
        "kml" => kml::parse(&content).with_context(|| format!("Failed to parse KML: {:?}", path))?,
        "json" | "geojson" => parse_geojson(&content)?,
        _ => return Err(anyhow!("Unsupported polygon format: {}", extension)),
    };

    tracing::info!(count = polygons.len(), path = ?path, "loaded polygons");
    Ok(polygons)
}

pub fn parse_geojson(content: &str) -> Result<Vec<NamedPolygon>> {
    let geojson: GeoJson = content.parse().context("Failed to parse GeoJSON")?;

    let features = match geojson {
        GeoJson::FeatureCollection(fc) => fc.features,
        GeoJson::Feature(feature) => vec![feature],
        GeoJson::Geometry(geometry) => vec![Feature::from(geometry)],
    };

    let mut polygons = Vec::new();
    for feature in features {
        let name = feature
            .properties
            .as_ref()
            .and_then(|props| props.get("name"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let id = match &feature.id {
            Some(Id::String(s)) => Some(s.clone()),
            Some(Id::Number(n)) => Some(n.to_string()),
            None => None,
        };

        let rings: Vec<Vec<[f64; 2]>> = match feature.geometry.map(|g| g.value) {
            Some(Value::Polygon(rings)) => rings.first().map(|r| positions(r)).into_iter().collect(),
            Some(Value::MultiPolygon(members)) => members
                .iter()
                .filter_map(|rings| rings.first().map(|r| positions(r)))
                .collect(),
            _ => continue, // points, lines and empty features
        };

        let multi = rings.len() > 1;
        for (part, coordinates) in rings.into_iter().enumerate() {
            let index = polygons.len();
            let mut name = name.clone().unwrap_or_else(|| format!("Polygon {}", index + 1));
            let mut id = id.clone().unwrap_or_else(|| format!("geojson_polygon_{index}"));
            if multi {
                name = format!("{name} ({})", part + 1);
                id = format!("{id}_{part}");
            }
            polygons.push(NamedPolygon { name, coordinates, id });
        }
    }

    Ok(polygons)
}

/// Picks a polygon by id, name or 1-based index; the first one when no
/// selector is given.
pub fn select<'a>(polygons: &'a [NamedPolygon], selector: Option<&str>) -> Result<&'a NamedPolygon> {
    let Some(selector) = selector else {
        return polygons.first().ok_or_else(|| anyhow!("No polygons found in input"));
    };
    polygons
        .iter()
        .find(|p| p.id == selector || p.name == selector)
        .or_else(|| {
            selector
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| polygons.get(i))
        })
        .ok_or_else(|| anyhow!("No polygon matches '{}'", selector))
}

fn positions(ring: &[Vec<f64>]) -> Vec<[f64; 2]> {
    ring.iter()
        .filter(|p| p.len() >= 2)
        .map(|p| [p[0], p[1]])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: &str = r#"[[[-96.89, 33.148], [-96.885, 33.148], [-96.885, 33.145], [-96.89, 33.145], [-96.89, 33.148]]]"#;

    #[test]
    fn drawn_rectangle_is_accepted() {
        let shape: DrawnShape = serde_json::from_str(&format!(
            r#"{{"type": "Feature", "properties": {{}}, "geometry": {{"type": "Rectangle", "coordinates": {SQUARE}}}}}"#
        ))
        .unwrap();
        let polygon = polygon_from_shape(&shape).unwrap();
        assert_eq!(polygon.bounds().min().x, -96.89);
    }

    #[test]
    fn drawn_line_is_rejected() {
        let shape = DrawnShape {
            geometry: ShapeGeometry { kind: "LineString".into(), coordinates: vec![] },
        };
        assert_eq!(
            polygon_from_shape(&shape).unwrap_err(),
            ExtractError::UnsupportedShape("LineString".into())
        );
    }

    #[test]
    fn drawn_shape_without_ring_has_too_few_vertices() {
        let shape = DrawnShape {
            geometry: ShapeGeometry { kind: "Polygon".into(), coordinates: vec![] },
        };
        assert_eq!(polygon_from_shape(&shape).unwrap_err(), ExtractError::TooFewVertices { count: 0 });
    }

    #[test]
    fn feature_collection_yields_named_polygons() {
        let content = format!(
            r#"{{
                "type": "FeatureCollection",
                "features": [
                    {{"type": "Feature", "id": "zone-a", "properties": {{"name": "Zone A"}},
                      "geometry": {{"type": "Polygon", "coordinates": {SQUARE}}}}},
                    {{"type": "Feature", "properties": null,
                      "geometry": {{"type": "Point", "coordinates": [1.0, 2.0]}}}},
                    {{"type": "Feature", "properties": {{}},
                      "geometry": {{"type": "Polygon", "coordinates": {SQUARE}}}}}
                ]
            }}"#
        );
        let polygons = parse_geojson(&content).unwrap();
        assert_eq!(polygons.len(), 2);
        assert_eq!(polygons[0].name, "Zone A");
        assert_eq!(polygons[0].id, "zone-a");
        assert_eq!(polygons[0].coordinates.len(), 5);
        assert_eq!(polygons[1].name, "Polygon 2");
        assert_eq!(polygons[1].id, "geojson_polygon_1");
    }

    #[test]
    fn bare_geometry_is_accepted() {
        let polygons = parse_geojson(&format!(r#"{{"type": "Polygon", "coordinates": {SQUARE}}}"#)).unwrap();
        assert_eq!(polygons.len(), 1);
        assert_eq!(polygons[0].coordinates[0], [-96.89, 33.148]);
    }

    #[test]
    fn select_by_name_id_or_index() {
        let make = |name: &str, id: &str| NamedPolygon { name: name.into(), coordinates: vec![], id: id.into() };
        let polygons = vec![make("North", "kml_polygon_0"), make("South", "kml_polygon_1")];
        assert_eq!(select(&polygons, None).unwrap().name, "North");
        assert_eq!(select(&polygons, Some("South")).unwrap().name, "South");
        assert_eq!(select(&polygons, Some("kml_polygon_1")).unwrap().name, "South");
        assert_eq!(select(&polygons, Some("2")).unwrap().name, "South");
        assert!(select(&polygons, Some("3")).is_err());
        assert!(select(&polygons, Some("0")).is_err());
        assert!(select(&[], None).is_err());
    }

    #[test]
    fn load_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("area.geojson");
        fs::write(&path, format!(r#"{{"type": "Polygon", "coordinates": {SQUARE}}}"#)).unwrap();
        assert_eq!(load_polygons(&path).unwrap().len(), 1);

        let other = dir.path().join("area.shp");
        fs::write(&other, "").unwrap();
        assert!(load_polygons(&other).is_err());
    }
}
