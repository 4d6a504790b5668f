use crate::archive::{read_archive, write_archive};
use crate::event::EventRecord;
use crate::filter::EventFilter;
use crate::store::{ArchiveHandle, ArchiveStore};
use crate::PipelineError;
use rustc_hash::FxHashSet;
use serde::Serialize;

/// Turns one merged archive into one final archive.
pub trait ArchiveCleaner: Sync {
    fn clean(&self, archive: &ArchiveHandle) -> Result<CleanReport, PipelineError>;
}

/// Event counts observed while cleaning one archive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub archive: ArchiveHandle,
    pub before: usize,
    pub after_dedup: usize,
    /// Count after each filter, in application order.
    pub after_filters: Vec<(String, usize)>,
    pub after_ordering: usize,
}

impl CleanReport {
    /// Labelled counts in the order they were taken.
    pub fn stages(&self) -> Vec<(String, usize)> {
        let mut stages = vec![
            ("before applying any filter".to_string(), self.before),
            ("after removing duplicates".to_string(), self.after_dedup),
        ];
        for (name, count) in &self.after_filters {
            stages.push((format!("after applying '{}'", name), *count));
        }
        stages.push(("after ordering".to_string(), self.after_ordering));
        stages
    }

    pub fn removed(&self) -> usize {
        self.before.saturating_sub(self.after_ordering)
    }
}

/// Deduplicates, filters and time-orders merged archives into the final tree.
pub struct Cleaner {
    store: ArchiveStore,
    filters: Vec<Box<dyn EventFilter>>,
}

impl Cleaner {
    pub fn new(store: ArchiveStore, filters: Vec<Box<dyn EventFilter>>) -> Self {
        let names: Vec<String> = filters.iter().map(|f| f.name()).collect();
        tracing::info!(
            merged = %store.merged_dir().display(),
            final_dir = %store.final_dir().display(),
            filters = ?names,
            "cleaner ready"
        );
        Self { store, filters }
    }

    pub fn filter_names(&self) -> Vec<String> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Clean a sequence of events without touching the filesystem.
    pub fn clean_events(
        &self,
        archive: &ArchiveHandle,
        events: Vec<EventRecord>,
    ) -> Result<(Vec<EventRecord>, CleanReport), PipelineError> {
        clean_events(archive, events, &self.filters)
    }
}

impl ArchiveCleaner for Cleaner {
    fn clean(&self, archive: &ArchiveHandle) -> Result<CleanReport, PipelineError> {
        let source = self.store.merged_path(archive);
        if !source.is_file() {
            return Err(PipelineError::integrity(format!(
                "merged archive {} does not exist ({})",
                archive,
                source.display()
            )));
        }

        tracing::debug!(archive = %archive, "reading merged archive");
        let events = read_archive(&source)?;
        let (cleaned, report) = self.clean_events(archive, events)?;

        tracing::debug!(archive = %archive, events = cleaned.len(), "writing events");
        write_archive(&self.store.final_path(archive), &cleaned)?;

        tracing::info!(
            archive = %archive,
            stages = ?report.stages(),
            "finished writing"
        );
        Ok(report)
    }
}

/// Dedup, then every filter in order, then a stable sort by trigger time.
pub fn clean_events(
    archive: &ArchiveHandle,
    events: Vec<EventRecord>,
    filters: &[Box<dyn EventFilter>],
) -> Result<(Vec<EventRecord>, CleanReport), PipelineError> {
    let before = events.len();

    let mut events = remove_duplicates(events);
    let after_dedup = events.len();

    let mut after_filters = Vec::with_capacity(filters.len());
    for filter in filters {
        events = apply_filter(filter.as_ref(), events)?;
        after_filters.push((filter.name(), events.len()));
    }

    events.sort_by_key(|e| e.triggered_at);

    let report = CleanReport {
        archive: archive.clone(),
        before,
        after_dedup,
        after_filters,
        after_ordering: events.len(),
    };
    Ok((events, report))
}

/// First occurrence wins.
fn remove_duplicates(events: Vec<EventRecord>) -> Vec<EventRecord> {
    let first: Vec<bool> = {
        let mut seen: FxHashSet<&EventRecord> = FxHashSet::default();
        events.iter().map(|e| seen.insert(e)).collect()
    };
    events
        .into_iter()
        .zip(first)
        .filter_map(|(event, first)| first.then_some(event))
        .collect()
}

fn apply_filter(
    filter: &dyn EventFilter,
    events: Vec<EventRecord>,
) -> Result<Vec<EventRecord>, PipelineError> {
    let mut kept = Vec::with_capacity(events.len());
    for event in events {
        let keep = filter.keep(&event).map_err(|e| match e {
            PipelineError::Filter { .. } => e,
            other => PipelineError::Filter {
                filter: filter.name(),
                reason: other.to_string(),
            },
        })?;
        if keep {
            kept.push(event);
        }
    }
    Ok(kept)
}
