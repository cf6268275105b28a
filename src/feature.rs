// 🗺️ Features - zones as GeoJSON-like features

use crate::zone::Zone;
use serde_json::{json, Map, Value};

/// Feature representation of a zone, pruned to `keys` when given.
///
/// The geometry is dropped when `keys` is given without `"geometry"`.
pub fn to_feature(zone: &Zone, keys: Option<&[String]>) -> Value {
    let optional_list = |list: &Vec<String>| {
        if list.is_empty() {
            Value::Null
        } else {
            json!(list)
        }
    };

    let mut properties = Map::new();
    properties.insert("level".into(), json!(zone.level));
    properties.insert("code".into(), json!(zone.code));
    properties.insert("name".into(), json!(zone.name));
    properties.insert("wikipedia".into(), json!(zone.wikipedia));
    properties.insert("dbpedia".into(), json!(zone.dbpedia));
    properties.insert("population".into(), json!(zone.population.unwrap_or(0)));
    properties.insert("area".into(), json!(zone.area.unwrap_or(0.0).round() as i64));
    properties.insert("flag".into(), json!(zone.flag));
    properties.insert("blazon".into(), json!(zone.blazon));
    properties.insert("keys".into(), json!(zone.keys));
    properties.insert("validity".into(), json!(zone.validity));
    properties.insert("parents".into(), optional_list(&zone.parents));
    properties.insert("ancestors".into(), optional_list(&zone.ancestors));
    properties.insert("successors".into(), optional_list(&zone.successors));

    if let Some(keys) = keys {
        properties.retain(|name, _| keys.iter().any(|k| k == name));
    }

    let mut feature = Map::new();
    feature.insert("id".into(), json!(zone.id));
    feature.insert("type".into(), json!("Feature"));

    let wants_geometry = keys.map_or(true, |keys| keys.iter().any(|k| k == "geometry"));
    if wants_geometry {
        let geometry = zone
            .geometry
            .as_ref()
            .map(|mp| json!(geojson::Geometry::new(geojson::Value::from(mp))))
            .unwrap_or(Value::Null);
        feature.insert("geometry".into(), geometry);
    }
    feature.insert("properties".into(), Value::Object(properties));

    Value::Object(feature)
}

/// Ordered feature collection of zones
pub fn feature_collection<'a, I>(zones: I, keys: Option<&[String]>) -> Value
where
    I: IntoIterator<Item = &'a Zone>,
{
    let features: Vec<Value> = zones.into_iter().map(|zone| to_feature(zone, keys)).collect();
    json!({
        "type": "FeatureCollection",
        "features": features,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::tests::square;
    use geo_types::MultiPolygon;

    fn paris() -> Zone {
        let mut zone = Zone::draft("75056", "Paris")
            .with_population(2_187_526)
            .with_area(105.4)
            .with_key("insee", "75056")
            .with_parents(["fr:departement:75"])
            .with_geometry(MultiPolygon(vec![square(2.2, 48.8, 0.2)]));
        zone.id = "fr:commune:75056@1942-01-01".to_string();
        zone.level = "fr:commune".to_string();
        zone
    }

    #[test]
    fn test_full_feature() {
        let feature = to_feature(&paris(), None);

        assert_eq!(feature["type"], "Feature");
        assert_eq!(feature["id"], "fr:commune:75056@1942-01-01");
        assert_eq!(feature["geometry"]["type"], "MultiPolygon");
        assert_eq!(feature["properties"]["area"], 105);
        assert_eq!(feature["properties"]["parents"], json!(["fr:departement:75"]));
        assert!(feature["properties"]["ancestors"].is_null());
    }

    #[test]
    fn test_keys_prune_properties_and_geometry() {
        let keys = vec!["code".to_string(), "name".to_string()];
        let feature = to_feature(&paris(), Some(&keys));

        let properties = feature["properties"].as_object().unwrap();
        assert_eq!(properties.len(), 2);
        assert!(feature.get("geometry").is_none());

        let keys = vec!["code".to_string(), "geometry".to_string()];
        let feature = to_feature(&paris(), Some(&keys));
        assert!(feature.get("geometry").is_some());
        assert_eq!(feature["properties"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_feature_collection_keeps_order() {
        let mut other = paris();
        other.id = "fr:commune:13055".to_string();
        let zones = vec![paris(), other];

        let collection = feature_collection(&zones, None);
        assert_eq!(collection["features"][1]["id"], "fr:commune:13055");
    }
}
