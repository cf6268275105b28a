// 🌐 International levels - country groups, countries, country subsets
//
// Countries come from Natural Earth. Its properties changed casing between
// releases, sometimes gained a trailing underscore, and encode "no value" as
// `-99`; `ne_prop` absorbs all of that.

use crate::aggregate::Members;
use crate::db::ZoneStore;
use crate::error::Result;
use crate::level::{LevelRegistry, StageContext};
use crate::sources::{text, GeoRecord, Row, Source};
use crate::zone::{Zone, ZoneUpdate};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const COUNTRY_GROUP: &str = "country-group";
pub const COUNTRY: &str = "country";
pub const COUNTRY_SUBSET: &str = "country-subset";

const NE_URL: &str = "https://raw.githubusercontent.com/nvkelso/natural-earth-vector/master/geojson/ne_110m_admin_0_countries_lakes.geojson";

/// Natural Earth null marker
const NE_NONE: &str = "-99";

/// Known gaps in Natural Earth, keyed by `NE_ID`
const NE_FIXES: &[(i64, &str, &str)] = &[
    // France is lacking ISO codes
    (1159320637, "ISO_A2", "FR"),
    (1159320637, "ISO_A3", "FRA"),
    // Norway is lacking ISO codes
    (1159321109, "ISO_A2", "NO"),
    (1159321109, "ISO_A3", "NOR"),
];

/// European Union member codes (historical list, United Kingdom and Norway included)
pub const UE_COUNTRIES: &[&str] = &[
    "at", "be", "bg", "cy", "hr", "dk", "ee", "fi", "gr", "fr", "es", "de", "hu", "ie", "it", "lv",
    "lt", "lu", "mt", "nl", "no", "pl", "pt", "cz", "ro", "gb", "sk", "si", "se",
];

pub fn register(registry: &mut LevelRegistry) -> Result<()> {
    registry.register(COUNTRY_GROUP, "Country group", 10, &[])?;
    registry.register(COUNTRY, "Country", 20, &[COUNTRY_GROUP])?;
    registry.register(COUNTRY_SUBSET, "Country subset", 30, &[COUNTRY])?;

    registry.extractor(COUNTRY, "extract_country", Source::new(NE_URL), None, extract_country)?;

    let mut world = BTreeMap::new();
    world.insert("keys".to_string(), json!({"default": "world"}));
    registry.aggregate(COUNTRY_GROUP, "world", "World", Members::list(["country:*"]), world)?;

    let mut ue = BTreeMap::new();
    ue.insert("parents".to_string(), json!(["country-group:world"]));
    ue.insert("keys".to_string(), json!({"default": "ue"}));
    ue.insert("wikipedia".to_string(), json!("en:European_Union"));
    ue.insert("wikidata".to_string(), json!("Q458"));
    registry.aggregate(
        COUNTRY_GROUP,
        "ue",
        "European Union",
        Members::list(UE_COUNTRIES.iter().map(|code| format!("country:{}", code))),
        ue,
    )?;

    registry.postprocessor(COUNTRY, "add_ue_to_parents", None, add_ue_to_parents)?;

    Ok(())
}

// ============================================================================
// NATURAL EARTH
// ============================================================================

/// Read a Natural Earth property, lowercased, `None` for missing or `-99`.
pub fn ne_prop(props: &Row, key: &str) -> Option<String> {
    let upper = key.to_uppercase();
    let lower = key.to_lowercase();
    let candidates = [upper.clone(), lower.clone(), format!("{}_", upper), format!("{}_", lower)];

    // Last present variant wins
    let value = candidates
        .iter()
        .filter(|candidate| props.contains_key(candidate.as_str()))
        .last()
        .and_then(|candidate| text(props, candidate))?;

    if value == NE_NONE {
        let ne_id = props.get("NE_ID").and_then(Value::as_i64)?;
        return NE_FIXES
            .iter()
            .find(|(id, field, _)| *id == ne_id && *field == upper)
            .map(|(_, _, fix)| fix.to_lowercase());
    }
    Some(value.to_lowercase())
}

/// Numeric Natural Earth property
fn ne_number(props: &Row, key: &str) -> Option<u64> {
    ne_prop(props, key)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v >= 0.0)
        .map(|v| v.round() as u64)
}

/// One Natural Earth country, keyed by its ISO alpha-2 code
pub fn extract_country(_store: &ZoneStore, record: &GeoRecord) -> anyhow::Result<Option<Zone>> {
    let props = &record.properties;
    let name = record.text("NAME").unwrap_or_default();

    let Some(code) = ne_prop(props, "ISO_A2") else {
        warn!("Missing iso code 2 for {}, skipping", name);
        return Ok(None);
    };

    let mut zone = Zone::draft(code.clone(), name)
        .with_parents(["country-group:world"])
        .with_key("iso2", code)
        .with_key("iso3", ne_prop(props, "ISO_A3"))
        .with_key("un", ne_prop(props, "UN_A3"))
        .with_key("fips", ne_prop(props, "FIPS_10"));
    zone.population = ne_number(props, "POP_EST");

    Ok(Some(zone))
}

pub fn add_ue_to_parents(ctx: &StageContext<'_>, _rows: Option<Vec<Row>>) -> anyhow::Result<usize> {
    info!("Adding European Union to countries parents");
    let codes: Vec<String> = UE_COUNTRIES.iter().map(|c| c.to_string()).collect();
    let update = ZoneUpdate::new().add_parents(["country-group:ue"]);

    let modified = ctx.store.update_codes(COUNTRY, &codes, &update)?;
    info!("✓ Added European Union as parent to {} countries", modified);
    Ok(modified)
}
