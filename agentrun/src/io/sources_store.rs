//! Per-run source aggregation with optional persistence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use serde::Serialize;

use crate::core::sources::{Enrichment, MergeLimits, Source, SourceVisit, SourcesView, normalize_url};
use crate::io::artifacts::{RunPaths, load_sources, write_sources};
use crate::io::trace::validate_run_id;

/// Outcome of importing a source list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub added: usize,
    pub total: usize,
}

#[derive(Default)]
struct RunSources {
    persist: bool,
    by_key: HashMap<String, Source>,
    updated_at: Option<DateTime<Utc>>,
}

impl RunSources {
    fn view(&self, run_id: &str) -> SourcesView {
        let mut sources: Vec<Source> = self.by_key.values().cloned().collect();
        sources.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.normalized_url.cmp(&b.normalized_url))
        });
        SourcesView {
            run_id: run_id.to_string(),
            updated_at: self.updated_at,
            sources,
        }
    }

    fn from_view(view: SourcesView, persist: bool) -> Self {
        let by_key = view
            .sources
            .into_iter()
            .map(|source| (source.normalized_url.clone(), source))
            .collect();
        Self {
            persist,
            by_key,
            updated_at: view.updated_at,
        }
    }
}

/// Deduplicated sources per run, keyed by normalized URL.
///
/// Only the live run and the most recently finished one are kept in memory;
/// older runs are served from their persisted `sources.json`.
pub struct SourceAggregator {
    runs_dir: PathBuf,
    limits: MergeLimits,
    runs: Mutex<HashMap<String, RunSources>>,
}

impl SourceAggregator {
    pub fn new(runs_dir: impl Into<PathBuf>, limits: MergeLimits) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            limits,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Start an empty source set for `run_id`.
    pub fn begin_run(&self, run_id: &str, persist: bool) {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.insert(
            run_id.to_string(),
            RunSources {
                persist,
                ..RunSources::default()
            },
        );
    }

    /// Merge a visit into the run's sources.
    ///
    /// Returns `None` when the URL cannot be normalized; such visits are
    /// skipped rather than failing the step.
    #[instrument(skip_all, fields(run_id, url = %visit.url))]
    pub fn record(
        &self,
        run_id: &str,
        visit: &SourceVisit,
        enrichment: Option<&Enrichment>,
    ) -> Result<Option<Source>> {
        let Some(key) = normalize_url(&visit.url) else {
            warn!("skipping source without a usable url");
            return Ok(None);
        };
        let now = Utc::now();
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(run) = runs.get_mut(run_id) else {
            warn!("dropping source for a run that is not open");
            return Ok(None);
        };
        let source = run
            .by_key
            .entry(key.clone())
            .or_insert_with(|| Source::new(key, now));
        source.merge(visit, enrichment, now, self.limits);
        let merged = source.clone();
        run.updated_at = Some(now);
        debug!(normalized_url = %merged.normalized_url, visits = merged.visits, "source recorded");

        if run.persist {
            let paths = RunPaths::new(&self.runs_dir, run_id);
            write_sources(&paths, &run.view(run_id))?;
        }
        Ok(Some(merged))
    }

    /// Current sources for `run_id`, falling back to the persisted snapshot.
    pub fn snapshot(&self, run_id: &str) -> Result<SourcesView> {
        validate_run_id(run_id)?;
        {
            let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(run) = runs.get(run_id) {
                return Ok(run.view(run_id));
            }
        }
        let paths = RunPaths::new(&self.runs_dir, run_id);
        Ok(load_sources(&paths)?.unwrap_or_else(|| SourcesView::empty(run_id)))
    }

    /// Mark `run_id` finished: it stays resident, every older run is evicted.
    pub fn finish_run(&self, run_id: &str) {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        runs.retain(|key, _| key == run_id);
    }

    /// Merge an exported source list into `run_id`, deduplicating by
    /// normalized URL. Runs not in memory are merged into their persisted file.
    #[instrument(skip_all, fields(run_id = %run_id, incoming = view.sources.len()))]
    pub fn import(&self, run_id: &str, view: &SourcesView) -> Result<ImportSummary> {
        validate_run_id(run_id)?;
        let paths = RunPaths::new(&self.runs_dir, run_id);
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut loaded = None;
        let run = match runs.get_mut(run_id) {
            Some(run) => run,
            None => {
                let persisted = load_sources(&paths)?.unwrap_or_else(|| SourcesView::empty(run_id));
                loaded.insert(RunSources::from_view(persisted, true))
            }
        };

        let mut added = 0;
        for incoming in &view.sources {
            let key = normalize_url(&incoming.normalized_url).or_else(|| normalize_url(&incoming.url));
            let Some(key) = key else {
                warn!(url = %incoming.url, "skipping imported source without a usable url");
                continue;
            };
            match run.by_key.get_mut(&key) {
                Some(existing) => existing.absorb(incoming, self.limits),
                None => {
                    let mut source = incoming.clone();
                    source.normalized_url = key.clone();
                    run.by_key.insert(key, source);
                    added += 1;
                }
            }
        }
        run.updated_at = Some(Utc::now());
        if run.persist {
            write_sources(&paths, &run.view(run_id))?;
        }
        let summary = ImportSummary {
            added,
            total: run.by_key.len(),
        };
        debug!(added = summary.added, total = summary.total, "sources imported");
        Ok(summary)
    }
}
