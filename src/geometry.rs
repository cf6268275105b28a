// 🗺️ Geometry - normalization, validity and union of zone shapes
//
// Zone geometries are ALWAYS stored as multipolygons. Sources hand us GeoJSON
// geometries of any type; this module coerces them, checks validity and merges
// them for aggregates.

use crate::error::{GeozonesError, Result};
use geo::{unary_union, Simplify, Validation};
use geo_types::{Geometry, MultiPolygon};

// ============================================================================
// DECODING
// ============================================================================

/// Decode a GeoJSON geometry object (`{"type": ..., "coordinates": ...}`).
pub fn from_geojson(value: &serde_json::Value) -> Result<Geometry<f64>> {
    let geom: geojson::Geometry = serde_json::from_value(value.clone())?;
    Geometry::<f64>::try_from(geom.value).map_err(|e| GeozonesError::Geometry(e.to_string()))
}

/// GeoJSON geometry type name, used in warnings.
pub fn type_name(geom: &Geometry<f64>) -> &'static str {
    match geom {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Coerce a raw geometry into a multipolygon.
///
/// Simplification (when a tolerance is given) happens before wrapping, so a
/// simplified polygon still ends up as a one-element multipolygon. Any other
/// geometry type is rejected with `GeozonesError::Geometry`.
pub fn normalize(geom: Geometry<f64>, simplify: Option<f64>) -> Result<MultiPolygon<f64>> {
    match geom {
        Geometry::Polygon(polygon) => {
            let polygon = match simplify {
                Some(tolerance) => polygon.simplify(&tolerance),
                None => polygon,
            };
            Ok(MultiPolygon(vec![polygon]))
        }
        Geometry::MultiPolygon(multi) => Ok(match simplify {
            Some(tolerance) => multi.simplify(&tolerance),
            None => multi,
        }),
        other => Err(GeozonesError::Geometry(format!(
            "Unsupported geometry type \"{}\"",
            type_name(&other)
        ))),
    }
}

/// Describe why a multipolygon is invalid, `None` when it is valid.
pub fn explain_invalidity(geom: &MultiPolygon<f64>) -> Option<String> {
    geom.check_validation().err().map(|e| e.to_string())
}

pub fn is_valid(geom: &MultiPolygon<f64>) -> bool {
    geom.is_valid()
}

/// A multipolygon is empty when it has no polygon with a non-empty exterior.
pub fn is_empty(geom: &MultiPolygon<f64>) -> bool {
    geom.0.iter().all(|polygon| polygon.exterior().0.is_empty())
}

// ============================================================================
// AGGREGATION
// ============================================================================

/// Union a set of multipolygons into a single multipolygon.
///
/// A union that collapses to one polygon still comes back as a one-element
/// multipolygon.
pub fn union_all(geoms: &[MultiPolygon<f64>]) -> MultiPolygon<f64> {
    unary_union(geoms.iter())
}

// ============================================================================
// SERDE (stored documents carry GeoJSON geometries)
// ============================================================================

/// `#[serde(with = "geometry::serde_geojson")]` for `Option<MultiPolygon<f64>>`.
pub mod serde_geojson {
    use geo_types::MultiPolygon;
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(geom: &Option<MultiPolygon<f64>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        geom.as_ref()
            .map(|mp| geojson::Geometry::new(geojson::Value::from(mp)))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<MultiPolygon<f64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<geojson::Geometry> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(geom) => {
                let decoded = geo_types::Geometry::<f64>::try_from(geom.value)
                    .map_err(D::Error::custom)?;
                match decoded {
                    geo_types::Geometry::MultiPolygon(mp) => Ok(Some(mp)),
                    geo_types::Geometry::Polygon(p) => Ok(Some(MultiPolygon(vec![p]))),
                    other => Err(D::Error::custom(format!(
                        "expected a multipolygon, got {}",
                        super::type_name(&other)
                    ))),
                }
            }
        }
    }
}
