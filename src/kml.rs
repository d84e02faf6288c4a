//! Minimal KML support: polygon outer rings in, named polygon documents out.

use crate::error::ExtractError;
use crate::types::NamedPolygon;
use anyhow::Result;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::fmt::Write as _;

/// Extracts the outer boundary of every `<Polygon>` in a KML document.
///
/// Element names are matched without their namespace prefix, so KML 2.0–2.2
/// and un-namespaced documents all work. Polygons with fewer than three
/// coordinate pairs are skipped but still consume an index.
pub fn parse(content: &str) -> Result<Vec<NamedPolygon>> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut placemark_name: Option<String> = None;
    let mut ring_text: Option<String> = None;
    let mut seen = 0usize;
    let mut polygons = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "Polygon" {
                    ring_text = Some(String::new());
                }
                stack.push(name);
            }
            Event::Text(t) => {
                let text = t.unescape()?;
                on_text(&stack, &text, &mut placemark_name, &mut ring_text);
            }
            Event::CData(c) => {
                let raw = c.into_inner();
                let text = String::from_utf8_lossy(&raw);
                on_text(&stack, &text, &mut placemark_name, &mut ring_text);
            }
            Event::End(e) => {
                stack.pop();
                match e.local_name().as_ref() {
                    b"Polygon" => {
                        let coordinates = parse_coordinates(&ring_text.take().unwrap_or_default());
                        if coordinates.len() >= 3 {
                            polygons.push(NamedPolygon {
                                name: placemark_name.clone().unwrap_or_else(|| format!("Polygon {}", seen + 1)),
                                coordinates,
                                id: format!("kml_polygon_{seen}"),
                            });
                        } else {
                            tracing::warn!(index = seen, "skipping KML polygon with fewer than 3 coordinates");
                        }
                        seen += 1;
                    }
                    b"Placemark" => placemark_name = None,
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(polygons)
}

fn on_text(stack: &[String], text: &str, placemark_name: &mut Option<String>, ring_text: &mut Option<String>) {
    let Some(current) = stack.last() else { return };
    let parent = stack.len().checked_sub(2).map(|i| stack[i].as_str());

    if current == "name" && parent == Some("Placemark") {
        *placemark_name = Some(text.trim().to_string());
    } else if current == "coordinates" && stack.iter().any(|s| s == "outerBoundaryIs") {
        if let Some(ring) = ring_text.as_mut() {
            ring.push_str(text);
            ring.push(' ');
        }
    }
}

/// Parses whitespace-separated `lon,lat[,alt]` tuples, dropping malformed ones.
pub fn parse_coordinates(text: &str) -> Vec<[f64; 2]> {
    text.split_whitespace()
        .filter_map(|tuple| {
            let mut parts = tuple.split(',');
            let lon = parts.next()?.trim().parse::<f64>().ok()?;
            let lat = parts.next()?.trim().parse::<f64>().ok()?;
            Some([lon, lat])
        })
        .collect()
}

/// Parses one `longitude,latitude` pair per line.
pub fn parse_coordinate_lines(text: &str) -> Vec<[f64; 2]> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.trim().split(',');
            let lon = parts.next()?.trim().parse::<f64>().ok()?;
            let lat = parts.next()?.trim().parse::<f64>().ok()?;
            Some([lon, lat])
        })
        .collect()
}

/// Renders a KML 2.2 document with one Placemark per polygon. Each ring is
/// closed by repeating its first vertex when needed.
pub fn write_document(polygons: &[NamedPolygon]) -> Result<String, ExtractError> {
    let mut placemarks = String::new();
    for polygon in polygons {
        write_placemark(&mut placemarks, polygon)?;
    }

    Ok(format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <name>Generated Polygons</name>
{placemarks}  </Document>
</kml>
"#
    ))
}

fn write_placemark(out: &mut String, polygon: &NamedPolygon) -> Result<(), ExtractError> {
    if polygon.coordinates.len() < 3 {
        return Err(ExtractError::TooFewVertices { count: polygon.coordinates.len() });
    }
    let mut ring = polygon.coordinates.clone();
    if ring.first() != ring.last() {
        ring.push(ring[0]);
    }

    let _ = writeln!(out, "    <Placemark>");
    let _ = writeln!(out, "      <name>{}</name>", escape(polygon.name.as_str()));
    let _ = writeln!(out, "      <Polygon>");
    let _ = writeln!(out, "        <outerBoundaryIs>");
    let _ = writeln!(out, "          <LinearRing>");
    let _ = writeln!(out, "            <coordinates>");
    for [lon, lat] in &ring {
        let _ = writeln!(out, "              {lon},{lat},0");
    }
    let _ = writeln!(out, "            </coordinates>");
    let _ = writeln!(out, "          </LinearRing>");
    let _ = writeln!(out, "        </outerBoundaryIs>");
    let _ = writeln!(out, "      </Polygon>");
    let _ = writeln!(out, "    </Placemark>");
    Ok(())
}
