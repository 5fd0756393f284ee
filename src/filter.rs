use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Resource kinds as reported by the rendering engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    #[serde(alias = "textTrack")]
    TextTrack,
    Xhr,
    Fetch,
    #[serde(alias = "eventSource")]
    EventSource,
    #[serde(alias = "webSocket")]
    WebSocket,
    Manifest,
    Ping,
    #[serde(alias = "misc", alias = "miscellaneous")]
    Other,
}

impl ResourceType {
    pub const ALL: [ResourceType; 14] = [
        ResourceType::Document,
        ResourceType::Stylesheet,
        ResourceType::Image,
        ResourceType::Media,
        ResourceType::Font,
        ResourceType::Script,
        ResourceType::TextTrack,
        ResourceType::Xhr,
        ResourceType::Fetch,
        ResourceType::EventSource,
        ResourceType::WebSocket,
        ResourceType::Manifest,
        ResourceType::Ping,
        ResourceType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Document => "document",
            ResourceType::Stylesheet => "stylesheet",
            ResourceType::Image => "image",
            ResourceType::Media => "media",
            ResourceType::Font => "font",
            ResourceType::Script => "script",
            ResourceType::TextTrack => "texttrack",
            ResourceType::Xhr => "xhr",
            ResourceType::Fetch => "fetch",
            ResourceType::EventSource => "eventsource",
            ResourceType::WebSocket => "websocket",
            ResourceType::Manifest => "manifest",
            ResourceType::Ping => "ping",
            ResourceType::Other => "other",
        }
    }

    /// Parse an engine- or caller-supplied name, ignoring case
    pub fn parse(name: &str) -> Option<ResourceType> {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "misc" | "miscellaneous" => Some(ResourceType::Other),
            "cspviolationreport" | "signedexchange" | "prefetch" | "preflight" => {
                Some(ResourceType::Other)
            }
            _ => Self::ALL.iter().copied().find(|t| t.as_str() == name),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Abort,
    Continue,
}

/// Per-job block-set of resource kinds
///
/// Blocking fonts reflows font-dependent layouts and blocking stylesheets or
/// images changes the artifact outright, so the set is always stated by the
/// caller and never inferred.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFilter {
    blocked: BTreeSet<ResourceType>,
}

impl ResourceFilter {
    pub fn new(blocked: impl IntoIterator<Item = ResourceType>) -> Self {
        Self {
            blocked: blocked.into_iter().collect(),
        }
    }

    /// A filter that lets everything through
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Filtering is only installed when something is actually blocked
    pub fn is_enabled(&self) -> bool {
        !self.blocked.is_empty()
    }

    pub fn blocked(&self) -> &BTreeSet<ResourceType> {
        &self.blocked
    }

    pub fn decide(&self, resource_type: ResourceType) -> FilterDecision {
        // The top-level document is what the job asked for.
        if resource_type == ResourceType::Document {
            return FilterDecision::Continue;
        }

        if self.blocked.contains(&resource_type) {
            FilterDecision::Abort
        } else {
            FilterDecision::Continue
        }
    }
}

/// Per-context counters of filter decisions
#[derive(Debug, Default)]
pub struct FilterStats {
    aborted: AtomicUsize,
    continued: AtomicUsize,
}

impl FilterStats {
    pub fn record(&self, decision: FilterDecision) {
        match decision {
            FilterDecision::Abort => self.aborted.fetch_add(1, Ordering::Relaxed),
            FilterDecision::Continue => self.continued.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::Relaxed)
    }

    pub fn continued(&self) -> usize {
        self.continued.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_only_configured_types() {
        let filter = ResourceFilter::new([ResourceType::Font, ResourceType::Media]);

        assert!(filter.is_enabled());
        assert_eq!(filter.decide(ResourceType::Font), FilterDecision::Abort);
        assert_eq!(filter.decide(ResourceType::Media), FilterDecision::Abort);
        assert_eq!(filter.decide(ResourceType::Image), FilterDecision::Continue);
        assert_eq!(filter.decide(ResourceType::Script), FilterDecision::Continue);
    }

    #[test]
    fn never_blocks_the_document() {
        let filter = ResourceFilter::new(ResourceType::ALL);
        assert_eq!(filter.decide(ResourceType::Document), FilterDecision::Continue);
        assert_eq!(filter.decide(ResourceType::Other), FilterDecision::Abort);
    }

    #[test]
    fn empty_filter_is_disabled() {
        let filter = ResourceFilter::allow_all();
        assert!(!filter.is_enabled());
        assert_eq!(filter.decide(ResourceType::Font), FilterDecision::Continue);
    }

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!(ResourceType::parse("Font"), Some(ResourceType::Font));
        assert_eq!(ResourceType::parse("websocket"), Some(ResourceType::WebSocket));
        assert_eq!(ResourceType::parse("miscellaneous"), Some(ResourceType::Other));
        assert_eq!(ResourceType::parse("CSPViolationReport"), Some(ResourceType::Other));
        assert_eq!(ResourceType::parse("bogus"), None);

        let parsed: BTreeSet<ResourceType> =
            serde_json::from_str(r#"["font","media","misc","webSocket"]"#).unwrap();
        assert!(parsed.contains(&ResourceType::Other));
        assert!(parsed.contains(&ResourceType::WebSocket));
    }

    #[test]
    fn stats_count_decisions() {
        let stats = FilterStats::default();
        stats.record(FilterDecision::Abort);
        stats.record(FilterDecision::Abort);
        stats.record(FilterDecision::Continue);
        assert_eq!(stats.aborted(), 2);
        assert_eq!(stats.continued(), 1);
    }
}
