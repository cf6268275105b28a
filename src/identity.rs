// 🔑 Zone identity
// `{level}:{code}` for timeless zones, `{level}:{code}@{start}` for historical ones.

use crate::zone::Zone;

/// Compute the stable id of an extracted zone.
///
/// An id already set by the extractor is kept verbatim.
pub fn assign_id(level_id: &str, zone: &Zone) -> String {
    if !zone.id.is_empty() {
        return zone.id.clone();
    }

    let id = zone_id(level_id, &zone.code);
    match zone.validity.start {
        Some(start) => format!("{}@{}", id, start),
        None => id,
    }
}

/// `{level}:{code}`, also the id of aggregates
pub fn zone_id(level_id: &str, code: &str) -> String {
    format!("{}:{}", level_id, code)
}

/// Level id of a wildcard member reference (`country:*` → `country`)
pub fn wildcard_level(reference: &str) -> Option<&str> {
    reference.strip_suffix(":*")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::Validity;
    use chrono::NaiveDate;

    #[test]
    fn test_assign_id_with_validity_start() {
        let start = NaiveDate::from_ymd_opt(2019, 1, 1).unwrap();
        let zone = Zone::draft("75056", "Paris").with_validity(Validity::since(start));
        assert_eq!(assign_id("fr:commune", &zone), "fr:commune:75056@2019-01-01");
    }

    #[test]
    fn test_assign_id_without_validity() {
        let zone = Zone::draft("fr", "France");
        assert_eq!(assign_id("country", &zone), "country:fr");

        // End alone does not enter the id
        let end = NaiveDate::from_ymd_opt(2015, 12, 31).unwrap();
        let zone = Zone::draft("23", "Haute-Normandie").with_validity(Validity::new(None, Some(end)));
        assert_eq!(assign_id("fr:region", &zone), "fr:region:23");
    }

    #[test]
    fn test_explicit_id_is_kept() {
        let mut zone = Zone::draft("fr", "France");
        zone.id = "country:fr@1958-10-04".to_string();
        assert_eq!(assign_id("country", &zone), "country:fr@1958-10-04");
    }

    #[test]
    fn test_wildcard_level() {
        assert_eq!(wildcard_level("country:*"), Some("country"));
        assert_eq!(wildcard_level("country:fr"), None);
    }
}
