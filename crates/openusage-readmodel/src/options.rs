use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

/// Configuration accepted by the read model.
#[derive(Debug, Clone, Default)]
pub struct ReadModelOptions {
    /// source provider -> target provider. Usage recorded under the source
    /// provider id is folded into the target provider's snapshot.
    pub provider_links: BTreeMap<String, String>,
    /// Optional time-window hint such as `7d` or `24h`. When it parses,
    /// the usage queries are bounded to occurred_at >= now - window;
    /// otherwise it is ignored.
    pub window: Option<String>,
}

impl ReadModelOptions {
    /// Links with both sides lowercased and trimmed; blank entries dropped.
    pub fn normalized_links(&self) -> BTreeMap<String, String> {
        self.provider_links
            .iter()
            .filter_map(|(source, target)| {
                let source = source.trim().to_lowercase();
                let target = target.trim().to_lowercase();
                (!source.is_empty() && !target.is_empty()).then_some((source, target))
            })
            .collect()
    }

    /// Lower bound implied by the window hint, when it parses.
    pub fn window_since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let window = self.window.as_deref()?.trim().to_lowercase();
        let unit = window.chars().last()?;
        let digits = &window[..window.len() - unit.len_utf8()];
        let amount: i64 = digits.parse().ok()?;
        if amount <= 0 {
            return None;
        }
        match unit {
            'd' => Some(now - Duration::days(amount)),
            'h' => Some(now - Duration::hours(amount)),
            _ => None,
        }
    }
}
