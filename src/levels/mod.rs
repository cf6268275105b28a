// 🌍 Built-in levels
// International levels first: the French hierarchy hangs below `country`.

pub mod france;
pub mod world;

use crate::error::Result;
use crate::level::LevelRegistry;

/// Registry with every built-in level and its callbacks
pub fn default_registry() -> Result<LevelRegistry> {
    let mut registry = LevelRegistry::new();
    world::register(&mut registry)?;
    france::register(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_traversal() {
        let registry = default_registry().unwrap();
        let ids: Vec<&str> = registry.traverse().iter().map(|l| l.id.as_str()).collect();

        assert_eq!(ids[0], "country-group");
        assert_eq!(ids.len(), registry.count());
        assert_eq!(ids.iter().filter(|id| **id == "fr:commune").count(), 1);

        // Children come after their parents
        let position = |id: &str| ids.iter().position(|l| *l == id).unwrap();
        assert!(position("fr:region") < position("fr:departement"));
        assert!(position("fr:departement") < position("fr:arrondissement"));
        assert!(position("fr:arrondissement") < position("fr:commune"));
    }

    #[test]
    fn test_default_registry_downloads() {
        let registry = default_registry().unwrap();
        let downloads = registry.downloads();

        assert!(downloads
            .iter()
            .any(|(_, target)| target == "fr:departement/departements.csv"));
        assert!(downloads.iter().all(|(url, _)| url.starts_with("http")));
    }

    #[test]
    fn test_commune_parents_attached_before_rollups() {
        let registry = default_registry().unwrap();
        let ids: Vec<&str> = registry.traverse().iter().map(|l| l.id.as_str()).collect();
        let names: Vec<&str> = registry
            .get("fr:departement")
            .unwrap()
            .postprocessors
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        let position = |name: &str| names.iter().position(|n| *n == name).unwrap();

        assert_eq!(position("attach_current_french_communes_parents"), 0);
        assert!(position("commune_with_districts") < position("compute_departement_area_and_population"));

        // District rollup and EPCI attachment run after the departement stages
        let level = |id: &str| ids.iter().position(|l| *l == id).unwrap();
        assert!(level("fr:departement") < level("fr:arrondissement"));
        assert!(level("fr:commune") < level("fr:epci"));
    }
}
