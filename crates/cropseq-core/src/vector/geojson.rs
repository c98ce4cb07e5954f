//! GeoJSON output of polygon layers.
//!
//! Each feature carries `gridcode`, one `<prefix>_<year>` column per year
//! (null when the code had no lookup entry), `count0`, `count45` and
//! `shape_area`. The collection names its CRS and lists its years so the
//! file can be read back without outside context.
use std::fs;
use std::path::Path;

use geo::{Coord, LineString, Polygon};
use serde_json::{json, Map, Value};

use super::{PolygonLayer, PolygonRecord};
use crate::error::{CropSeqError, Result};

fn ring_json(ring: &LineString<f64>) -> Value {
    Value::Array(ring.coords().map(|c| json!([c.x, c.y])).collect())
}

fn polygon_json(poly: &Polygon<f64>) -> Value {
    let rings: Vec<Value> = std::iter::once(poly.exterior())
        .chain(poly.interiors())
        .map(ring_json)
        .collect();
    json!({ "type": "Polygon", "coordinates": rings })
}

fn feature_json(record: &PolygonRecord, years: &[u16], prefix: &str) -> Value {
    let mut props = Map::new();
    props.insert("gridcode".into(), json!(record.code));
    for (i, year) in years.iter().enumerate() {
        let v = record.values.as_ref().and_then(|v| v.get(i)).map_or(Value::Null, |&v| json!(v));
        props.insert(format!("{prefix}_{year}"), v);
    }
    props.insert("count0".into(), json!(record.count0));
    props.insert("count45".into(), json!(record.count45));
    props.insert("shape_area".into(), json!(record.area));
    json!({ "type": "Feature", "properties": props, "geometry": polygon_json(&record.geometry) })
}

pub fn to_feature_collection(layer: &PolygonLayer, prefix: &str) -> Value {
    let features: Vec<Value> = layer
        .records
        .iter()
        .map(|r| feature_json(r, &layer.years, prefix))
        .collect();
    let mut fc = json!({
        "type": "FeatureCollection",
        "years": layer.years,
        "features": features,
    });
    if let Some(crs) = &layer.crs {
        fc["crs"] = json!({ "type": "name", "properties": { "name": crs } });
    }
    fc
}

pub fn write_geojson(path: impl AsRef<Path>, layer: &PolygonLayer, prefix: &str) -> Result<()> {
    let text = serde_json::to_string(&to_feature_collection(layer, prefix))?;
    fs::write(path, text)?;
    Ok(())
}

// ── Reading ──────────────────────────────────────────────────────────────────

fn bad(msg: impl Into<String>) -> CropSeqError {
    CropSeqError::InvalidGeoJson(msg.into())
}

fn ring_from(v: &Value) -> Result<LineString<f64>> {
    let pts = v.as_array().ok_or_else(|| bad("ring is not an array"))?;
    let coords = pts
        .iter()
        .map(|p| match (p.get(0).and_then(Value::as_f64), p.get(1).and_then(Value::as_f64)) {
            (Some(x), Some(y)) => Ok(Coord { x, y }),
            _ => Err(bad("coordinate is not a number pair")),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LineString::new(coords))
}

fn polygon_from(geometry: &Value) -> Result<Polygon<f64>> {
    if geometry["type"] != "Polygon" {
        return Err(bad(format!("unsupported geometry type {}", geometry["type"])));
    }
    let rings = geometry["coordinates"]
        .as_array()
        .ok_or_else(|| bad("polygon coordinates missing"))?;
    let mut rings = rings.iter().map(ring_from).collect::<Result<Vec<_>>>()?.into_iter();
    let exterior = rings.next().ok_or_else(|| bad("polygon has no rings"))?;
    Ok(Polygon::new(exterior, rings.collect()))
}

fn record_from(feature: &Value, years: &[u16], prefix: &str) -> Result<PolygonRecord> {
    let props = &feature["properties"];
    let code = props["gridcode"]
        .as_u64()
        .and_then(|c| u32::try_from(c).ok())
        .ok_or_else(|| bad("feature without integer gridcode"))?;
    let values: Option<Vec<u8>> = years
        .iter()
        .map(|y| props[format!("{prefix}_{y}")].as_u64().and_then(|v| u8::try_from(v).ok()))
        .collect();
    let count = |k: &str| props[k].as_u64().and_then(|v| u32::try_from(v).ok()).unwrap_or(0);

    let mut record = PolygonRecord::new(code, polygon_from(&feature["geometry"])?, None);
    record.values = values.filter(|v| !v.is_empty());
    record.count0 = count("count0");
    record.count45 = count("count45");
    Ok(record)
}

/// Read a collection written by [`write_geojson`]. Areas are recomputed
/// from the geometry.
pub fn read_geojson(path: impl AsRef<Path>, prefix: &str) -> Result<PolygonLayer> {
    let fc: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
    let years: Vec<u16> = serde_json::from_value(fc["years"].clone()).unwrap_or_default();
    let crs = fc["crs"]["properties"]["name"].as_str().map(str::to_string);
    let features = fc["features"].as_array().ok_or_else(|| bad("collection has no features array"))?;
    let records = features
        .iter()
        .map(|f| record_from(f, &years, prefix))
        .collect::<Result<Vec<_>>>()?;
    Ok(PolygonLayer { years, crs, records })
}
