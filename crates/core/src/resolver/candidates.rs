//! Candidate page URLs for an entity.

use crate::config::SourceConfig;
use crate::store::EntityKey;

/// Name as the source spells it in URLs.
pub fn source_name<'a>(source: &'a SourceConfig, name: &'a str) -> &'a str {
    source.aliases.get(name).map(String::as_str).unwrap_or(name)
}

/// Expand every URL template for `key`, in configured priority order.
pub fn candidate_urls(source: &SourceConfig, key: &EntityKey) -> Vec<String> {
    let name = source_name(source, &key.name);
    let period = key.period.to_string();

    source
        .url_templates
        .iter()
        .map(|template| {
            template
                .replace("{name}", name)
                .replace("{period}", &period)
        })
        .collect()
}

/// Move `cached` to the front of `candidates` if it is one of them.
///
/// Returns false when the cached URL is not a generated candidate; the list
/// is left untouched in that case.
pub fn promote_cached(candidates: &mut Vec<String>, cached: &str) -> bool {
    match candidates.iter().position(|c| c == cached) {
        Some(index) => {
            let url = candidates.remove(index);
            candidates.insert(0, url);
            true
        }
        None => false,
    }
}
