use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use openusage_store::Store;

pub const DIAG_UNMAPPED_PROVIDERS: &str = "telemetry_unmapped_providers";
pub const DIAG_PROVIDER_LINK_HINT: &str = "telemetry_provider_link_hint";

/// Provider ids seen in canonical usage that no configured snapshot will
/// absorb: neither the id itself nor its link target is configured.
/// Entries with a link to an unconfigured target render as `src->tgt`.
pub fn unmapped_providers(
    store: &Store,
    configured: &BTreeSet<String>,
    links: &BTreeMap<String, String>,
) -> Vec<String> {
    let seen = match store.distinct_usage_providers() {
        Ok(seen) => seen,
        Err(err) => {
            warn!(error = %err, "listing usage providers failed");
            return Vec::new();
        }
    };

    seen.into_iter()
        .filter_map(|provider| match links.get(&provider) {
            _ if configured.contains(&provider) => None,
            Some(target) if configured.contains(target) => None,
            Some(target) => Some(format!("{}->{}", provider, target)),
            None => Some(provider),
        })
        .collect()
}

/// Annotation applied to every output snapshot when unmapped providers
/// exist.
pub fn annotate_unmapped(
    diagnostics: &mut BTreeMap<String, String>,
    unmapped: &[String],
) {
    if unmapped.is_empty() {
        return;
    }
    diagnostics.insert(DIAG_UNMAPPED_PROVIDERS.to_string(), unmapped.join(","));
    diagnostics.insert(
        DIAG_PROVIDER_LINK_HINT.to_string(),
        "map these ids onto a configured provider via provider_links (source -> target)"
            .to_string(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use openusage_types::{IngestRequest, SourceChannel};

    fn store_with_providers(providers: &[&str]) -> Store {
        let store = Store::open_in_memory().unwrap();
        for (i, provider) in providers.iter().enumerate() {
            let mut request = IngestRequest::new("claude_code", SourceChannel::Hook);
            request.session_id = Some("s".to_string());
            request.message_id = Some(format!("m{}", i));
            request.provider_id = Some(provider.to_string());
            store.ingest(&request).unwrap();
        }
        store
    }

    #[test]
    fn test_configured_and_linked_providers_are_mapped() {
        let store = store_with_providers(&["anthropic", "claude_code", "mystery"]);
        let configured: BTreeSet<String> = ["claude_code".to_string()].into();
        let links: BTreeMap<String, String> =
            [("anthropic".to_string(), "claude_code".to_string())].into();

        let unmapped = unmapped_providers(&store, &configured, &links);
        assert_eq!(unmapped, vec!["mystery".to_string()]);
    }

    #[test]
    fn test_link_to_unconfigured_target_uses_arrow_notation() {
        let store = store_with_providers(&["anthropic"]);
        let configured: BTreeSet<String> = ["claude_code".to_string()].into();
        let links: BTreeMap<String, String> =
            [("anthropic".to_string(), "nowhere".to_string())].into();

        let unmapped = unmapped_providers(&store, &configured, &links);
        assert_eq!(unmapped, vec!["anthropic->nowhere".to_string()]);
    }

    #[test]
    fn test_annotation_only_when_unmapped_exist() {
        let mut diagnostics = BTreeMap::new();
        annotate_unmapped(&mut diagnostics, &[]);
        assert!(diagnostics.is_empty());

        annotate_unmapped(&mut diagnostics, &["mystery".to_string()]);
        assert_eq!(
            diagnostics.get(DIAG_UNMAPPED_PROVIDERS).map(String::as_str),
            Some("mystery")
        );
        assert!(diagnostics.contains_key(DIAG_PROVIDER_LINK_HINT));
    }
}
