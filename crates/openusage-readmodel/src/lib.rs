// Read model: overlays the canonical telemetry stream onto the provider
// snapshots the daemon hands over. Three stages per snapshot: root
// hydration from the latest stored limit snapshot, provider-link
// annotation, and the canonical usage overlay. Outputs are new values;
// inputs are never mutated.

mod hydrate;
mod links;
mod options;
mod overlay;

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;

use openusage_store::Store;
use openusage_types::UsageSnapshot;

pub use hydrate::{ATTR_TELEMETRY_ROOT, hydrate_root};
pub use links::{DIAG_PROVIDER_LINK_HINT, DIAG_UNMAPPED_PROVIDERS, annotate_unmapped, unmapped_providers};
pub use options::ReadModelOptions;
pub use overlay::overlay_usage;

pub struct ReadModel<'a> {
    store: &'a Store,
}

impl<'a> ReadModel<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Enrich the base snapshot map. Keys are preserved; every value is a
    /// freshly built snapshot.
    pub fn apply(
        &self,
        base: &BTreeMap<String, UsageSnapshot>,
        options: &ReadModelOptions,
    ) -> BTreeMap<String, UsageSnapshot> {
        let links = options.normalized_links();
        let configured: BTreeSet<String> = base
            .values()
            .map(|snapshot| snapshot.provider_id.trim().to_lowercase())
            .filter(|provider| !provider.is_empty())
            .collect();
        let unmapped = unmapped_providers(self.store, &configured, &links);
        let window_since = options.window_since(Utc::now());

        base.iter()
            .map(|(key, snapshot)| {
                let hydrated = hydrate_root(self.store, snapshot);
                let mut enriched = overlay_usage(self.store, &hydrated, &links, window_since);
                annotate_unmapped(&mut enriched.diagnostics, &unmapped);
                (key.clone(), enriched)
            })
            .collect()
    }
}

/// Entry point tolerating an absent store (no database configured): the
/// base snapshots are returned unchanged rather than failing the UI.
pub fn apply_read_model(
    store: Option<&Store>,
    base: &BTreeMap<String, UsageSnapshot>,
    options: &ReadModelOptions,
) -> BTreeMap<String, UsageSnapshot> {
    match store {
        Some(store) => ReadModel::new(store).apply(base, options),
        None => base.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_store_passes_base_through() {
        let mut base = BTreeMap::new();
        base.insert(
            "claude_code".to_string(),
            UsageSnapshot::new("claude_code", "work"),
        );

        let out = apply_read_model(None, &base, &ReadModelOptions::default());
        assert_eq!(out, base);
    }
}
