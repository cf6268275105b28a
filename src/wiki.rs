// 📚 Wiki helpers - Wikipedia / DBpedia / Wikidata / Commons identifiers

use regex::Regex;
use std::sync::OnceLock;

pub const WIKIDATA_ENTITY: &str = "http://www.wikidata.org/entity/";

fn wikipedia_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https?://(?:(?P<namespace>\w+)\.)?wikipedia\.org/wiki/(?P<path>.+)$")
            .expect("valid wikipedia regex")
    })
}

fn dbpedia_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https?://(?:(?P<namespace>\w+)\.)?dbpedia\.org/resource/(?P<path>.+)$")
            .expect("valid dbpedia regex")
    })
}

fn commons_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https?://commons\.wikimedia\.org/wiki/Special:FilePath/(?P<path>.+)$")
            .expect("valid commons regex")
    })
}

fn is_url(s: &str) -> bool {
    s.starts_with("http:") || s.starts_with("https:")
}

/// Split a Wikipedia reference into `(namespace, path)`.
///
/// Accepts `ns:Path`, full URLs and bare paths.
fn split_wikipedia(reference: &str) -> (Option<String>, String) {
    let reference = reference.trim().replace(' ', "_");

    // Doubled namespace seen in some sources: `fr:fr:Path`
    if let Some(rest) = reference.strip_prefix("fr:fr:") {
        return (Some("fr".to_string()), rest.to_string());
    }
    if !is_url(&reference) {
        if let Some((namespace, path)) = reference.split_once(':') {
            return (Some(namespace.to_string()), path.to_string());
        }
        return (None, reference);
    }
    match wikipedia_re().captures(&reference) {
        Some(caps) => (
            caps.name("namespace").map(|m| m.as_str().to_string()),
            caps["path"].to_string(),
        ),
        None => (None, reference),
    }
}

/// DBpedia resource URI for a Wikipedia identifier or URL
pub fn wikipedia_to_dbpedia(reference: &str) -> Option<String> {
    if reference.trim().is_empty() {
        return None;
    }
    let (namespace, path) = split_wikipedia(reference);
    let base = match namespace {
        Some(ns) => format!("http://{}.dbpedia.org", ns),
        None => "http://dbpedia.org".to_string(),
    };
    Some(format!("{}/resource/{}", base, path))
}

/// `ns:Path` identifier from a Wikipedia URL (identifiers pass through)
pub fn wikipedia_url_to_id(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }
    if !is_url(url) && url.contains(':') {
        return Some(url.to_string());
    }
    match wikipedia_re().captures(url) {
        Some(caps) => match caps.name("namespace") {
            Some(ns) => Some(format!("{}:{}", ns.as_str(), &caps["path"])),
            None => Some(caps["path"].to_string()),
        },
        None => Some(url.to_string()),
    }
}

/// Wikipedia identifier from a DBpedia resource URI
pub fn dbpedia_to_wikipedia(uri: &str) -> Option<String> {
    let caps = dbpedia_re().captures(uri)?;
    match caps.name("namespace") {
        Some(ns) => Some(format!("{}:{}", ns.as_str(), &caps["path"])),
        None => Some(caps["path"].to_string()),
    }
}

/// File path of a Wikimedia Commons `Special:FilePath` URL
pub fn media_url_to_path(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }
    Some(commons_re().replace(url, "$path").into_owned())
}

/// `Q90` from `http://www.wikidata.org/entity/Q90`
pub fn data_uri_to_id(uri: &str) -> Option<String> {
    if uri.is_empty() {
        return None;
    }
    Some(uri.replace(WIKIDATA_ENTITY, ""))
}
