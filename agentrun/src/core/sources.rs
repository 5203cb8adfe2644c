//! Canonicalization and merge rules for visited sources.
//!
//! Dedup key: scheme and host lowercased, default port dropped, query and
//! fragment stripped, trailing `/` removed from non-root paths. Two visits
//! that only differ in query string or fragment therefore merge into one
//! [`Source`].

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

/// Characters of page text kept as an evidence excerpt.
const EXCERPT_CHARS: usize = 280;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>"'`\]\[(){}]+"#).expect("url pattern should be valid")
});

/// Canonical dedup key for `raw`, or `None` when it has no host.
pub fn normalize_url(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw.trim()).ok()?;
    let host = parsed
        .host_str()
        .map(str::trim)
        .filter(|value| !value.is_empty())?;

    let mut key = format!("{}://{}", parsed.scheme(), host.to_ascii_lowercase());
    if let Some(port) = parsed.port() {
        key.push(':');
        key.push_str(&port.to_string());
    }
    let path = parsed.path().trim_end_matches('/');
    if path.is_empty() {
        key.push('/');
    } else {
        key.push_str(path);
    }
    Some(key)
}

/// Distinct http(s) URLs mentioned in free text, in order of appearance.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for found in URL_RE.find_iter(text) {
        let url = found
            .as_str()
            .trim_end_matches(['.', ',', ';', ':', '!', '?']);
        if !urls.iter().any(|seen| seen == url) {
            urls.push(url.to_string());
        }
    }
    urls
}

/// A page visit reported by an agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceVisit {
    pub url: String,
    pub title: String,
    pub text: String,
    pub score: Option<f64>,
    pub step_id: Option<String>,
    pub agent: Option<String>,
    pub screenshot: Option<String>,
}

/// Optional relevancy data produced by a scorer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Enrichment {
    pub relevancy_score: Option<f64>,
    #[serde(rename = "match")]
    pub matched: Option<String>,
    pub how_helps: Option<String>,
    pub evidence_quotes: Vec<String>,
}

/// Caps applied to merged lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeLimits {
    pub max_quotes: usize,
    pub max_screenshots: usize,
}

impl Default for MergeLimits {
    fn default() -> Self {
        Self {
            max_quotes: 120,
            max_screenshots: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub normalized_url: String,
    pub url: String,
    pub title: String,
    pub relevancy_score: Option<f64>,
    #[serde(rename = "match")]
    pub matched: Option<String>,
    pub how_helps: Option<String>,
    pub evidence_quotes: Vec<String>,
    pub screenshot_paths: Vec<String>,
    pub seen_in_steps: Vec<String>,
    pub agents: Vec<String>,
    pub visits: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Sources recorded for one run, most recently seen first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesView {
    pub run_id: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub sources: Vec<Source>,
}

impl SourcesView {
    pub fn empty(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            updated_at: None,
            sources: Vec::new(),
        }
    }
}

impl Source {
    pub fn new(normalized_url: String, now: DateTime<Utc>) -> Self {
        Self {
            normalized_url,
            url: String::new(),
            title: String::new(),
            relevancy_score: None,
            matched: None,
            how_helps: None,
            evidence_quotes: Vec::new(),
            screenshot_paths: Vec::new(),
            seen_in_steps: Vec::new(),
            agents: Vec::new(),
            visits: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Fold a visit (and its optional enrichment) into this entry.
    ///
    /// Longer text fields win, the latest score wins, list fields are merged
    /// without duplicates up to `limits`.
    pub fn merge(
        &mut self,
        visit: &SourceVisit,
        enrichment: Option<&Enrichment>,
        now: DateTime<Utc>,
        limits: MergeLimits,
    ) {
        keep_longer(&mut self.url, visit.url.trim());
        keep_longer(&mut self.title, visit.title.trim());

        let score = enrichment
            .and_then(|e| e.relevancy_score)
            .or(visit.score)
            .filter(|s| s.is_finite());
        if let Some(score) = score {
            self.relevancy_score = Some(score.clamp(0.0, 1.0));
        }

        if let Some(excerpt) = excerpt(&visit.text) {
            push_unique(&mut self.evidence_quotes, excerpt, limits.max_quotes);
        }
        if let Some(enrichment) = enrichment {
            keep_longer_opt(&mut self.matched, enrichment.matched.as_deref());
            keep_longer_opt(&mut self.how_helps, enrichment.how_helps.as_deref());
            for quote in &enrichment.evidence_quotes {
                let quote = quote.trim();
                if !quote.is_empty() {
                    push_unique(&mut self.evidence_quotes, quote.to_string(), limits.max_quotes);
                }
            }
        }
        if let Some(path) = visit.screenshot.as_deref().map(str::trim)
            && !path.is_empty()
        {
            push_unique(
                &mut self.screenshot_paths,
                path.to_string(),
                limits.max_screenshots,
            );
        }
        if let Some(step_id) = &visit.step_id {
            push_unique(&mut self.seen_in_steps, step_id.clone(), usize::MAX);
        }
        if let Some(agent) = &visit.agent {
            push_unique(&mut self.agents, agent.clone(), usize::MAX);
        }

        self.visits += 1;
        self.last_seen = now;
    }
}

impl Source {
    /// Fold an entry from another source list (an imported export) into this one.
    pub fn absorb(&mut self, other: &Source, limits: MergeLimits) {
        keep_longer(&mut self.url, other.url.trim());
        keep_longer(&mut self.title, other.title.trim());
        if let Some(score) = other.relevancy_score.filter(|s| s.is_finite()) {
            self.relevancy_score = Some(score.clamp(0.0, 1.0));
        }
        keep_longer_opt(&mut self.matched, other.matched.as_deref());
        keep_longer_opt(&mut self.how_helps, other.how_helps.as_deref());
        for quote in &other.evidence_quotes {
            push_unique(&mut self.evidence_quotes, quote.clone(), limits.max_quotes);
        }
        for path in &other.screenshot_paths {
            push_unique(&mut self.screenshot_paths, path.clone(), limits.max_screenshots);
        }
        for step_id in &other.seen_in_steps {
            push_unique(&mut self.seen_in_steps, step_id.clone(), usize::MAX);
        }
        for agent in &other.agents {
            push_unique(&mut self.agents, agent.clone(), usize::MAX);
        }
        self.visits += other.visits;
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
    }
}

/// Whitespace-collapsed prefix of page text used as an evidence quote.
fn excerpt(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(EXCERPT_CHARS).collect())
}

fn keep_longer(slot: &mut String, candidate: &str) {
    if candidate.chars().count() > slot.chars().count() {
        *slot = candidate.to_string();
    }
}

fn keep_longer_opt(slot: &mut Option<String>, candidate: Option<&str>) {
    let Some(candidate) = candidate.map(str::trim).filter(|c| !c.is_empty()) else {
        return;
    };
    match slot {
        Some(existing) => keep_longer(existing, candidate),
        None => *slot = Some(candidate.to_string()),
    }
}

fn push_unique(list: &mut Vec<String>, value: String, cap: usize) {
    if list.len() < cap && !list.contains(&value) {
        list.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visit(url: &str, title: &str, text: &str) -> SourceVisit {
        SourceVisit {
            url: url.to_string(),
            title: title.to_string(),
            text: text.to_string(),
            step_id: Some("step-1".to_string()),
            agent: Some("web".to_string()),
            ..SourceVisit::default()
        }
    }

    #[test]
    fn normalize_strips_query_fragment_and_case() {
        assert_eq!(
            normalize_url("HTTPS://Example.COM/Cafes/?utm_source=x#top").as_deref(),
            Some("https://example.com/Cafes")
        );
        assert_eq!(
            normalize_url("https://example.com").as_deref(),
            Some("https://example.com/")
        );
        assert_eq!(
            normalize_url("http://example.com:80/a").as_deref(),
            Some("http://example.com/a")
        );
        assert_eq!(
            normalize_url("http://example.com:8080/a").as_deref(),
            Some("http://example.com:8080/a")
        );
    }

    #[test]
    fn normalize_rejects_hostless_input() {
        assert_eq!(normalize_url("not a url"), None);
        assert_eq!(normalize_url("mailto:someone@example.com"), None);
    }

    #[test]
    fn query_variants_share_a_key() {
        assert_eq!(
            normalize_url("https://example.com/page?a=1"),
            normalize_url("https://example.com/page?b=2")
        );
    }

    #[test]
    fn extract_urls_trims_punctuation_and_dedups() {
        let text = "See https://a.example/x. Also (https://b.example/y) and https://a.example/x";
        assert_eq!(
            extract_urls(text),
            vec!["https://a.example/x".to_string(), "https://b.example/y".to_string()]
        );
    }

    #[test]
    fn merge_combines_visits() {
        let now = Utc::now();
        let mut source = Source::new("https://example.com/page".to_string(), now);
        let limits = MergeLimits::default();

        source.merge(&visit("https://example.com/page", "Page", "first text"), None, now, limits);
        let mut second = visit("https://example.com/page?ref=1", "Page with longer title", "first text");
        second.score = Some(1.7);
        second.step_id = Some("step-2".to_string());
        source.merge(&second, None, now, limits);

        assert_eq!(source.visits, 2);
        assert_eq!(source.title, "Page with longer title");
        assert_eq!(source.url, "https://example.com/page?ref=1");
        assert_eq!(source.relevancy_score, Some(1.0));
        assert_eq!(source.evidence_quotes, vec!["first text".to_string()]);
        assert_eq!(source.seen_in_steps, vec!["step-1".to_string(), "step-2".to_string()]);
    }

    #[test]
    fn enrichment_score_wins_and_lists_are_capped() {
        let now = Utc::now();
        let mut source = Source::new("https://example.com/".to_string(), now);
        let limits = MergeLimits {
            max_quotes: 2,
            max_screenshots: 1,
        };
        let enrichment = Enrichment {
            relevancy_score: Some(0.4),
            matched: Some("lists cafes".to_string()),
            how_helps: None,
            evidence_quotes: vec!["q1".to_string(), "q2".to_string()],
        };
        let mut page = visit("https://example.com/", "Home", "page body");
        page.score = Some(0.9);
        page.screenshot = Some("shots/1.png".to_string());
        source.merge(&page, Some(&enrichment), now, limits);
        page.screenshot = Some("shots/2.png".to_string());
        source.merge(&page, None, now, limits);

        assert_eq!(source.relevancy_score, Some(0.9));
        assert_eq!(source.evidence_quotes.len(), 2);
        assert_eq!(source.screenshot_paths, vec!["shots/1.png".to_string()]);
        assert_eq!(source.matched.as_deref(), Some("lists cafes"));
    }

    #[test]
    fn absorb_keeps_the_richer_fields() {
        let earlier = Utc::now() - chrono::Duration::hours(1);
        let now = Utc::now();
        let mut source = Source::new("https://example.com/a".to_string(), now);
        source.merge(&visit("https://example.com/a", "A", "body"), None, now, MergeLimits::default());
        let mut imported = Source::new("https://example.com/a".to_string(), earlier);
        imported.title = "A page with a title".to_string();
        imported.visits = 3;
        imported.seen_in_steps = vec!["step-1".to_string(), "step-4".to_string()];

        source.absorb(&imported, MergeLimits::default());

        assert_eq!(source.title, "A page with a title");
        assert_eq!(source.visits, 4);
        assert_eq!(source.first_seen, earlier);
        assert_eq!(source.seen_in_steps, vec!["step-1".to_string(), "step-4".to_string()]);
    }
}
