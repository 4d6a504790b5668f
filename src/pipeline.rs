//! Orchestration of one consolidation run.
//!
//! 1. read identifiers of every raw archive (parallel)
//! 2. group archives by shared identifiers (single-threaded, after a barrier)
//! 3. merge every group into the merged tree (parallel)
//! 4. clean every merged archive into the final tree (parallel)
//!
//! Phases 3 and 4 share one pass: a group is cleaned as soon as its own
//! merge is done.

use crate::cleaner::{ArchiveCleaner, CleanReport, Cleaner};
use crate::config::PipelineConfig;
use crate::event::IdentifierSet;
use crate::filter::EventFilter;
use crate::group_merger::{GroupMerger, Merger};
use crate::grouper::{group_related_archives, validate_partition, Group};
use crate::id_reader::{ArchiveIdReader, IdReader};
use crate::store::{ArchiveHandle, ArchiveStore};
use crate::worker_pool::{TaskContext, WorkerPool};
use crate::PipelineError;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Instant;

/// Counts of one completed run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    pub workers: usize,
    pub archives_read: usize,
    pub distinct_identifiers: usize,
    pub groups: usize,
    pub merged: usize,
    pub cleaned: usize,
    pub events_before_cleaning: usize,
    pub events_after_cleaning: usize,
    pub reports: Vec<CleanReport>,
}

/// Result of phases 1 and 2.
#[derive(Clone, Debug, Serialize)]
pub struct Grouping {
    pub archives: Vec<ArchiveHandle>,
    pub distinct_identifiers: usize,
    pub groups: Vec<Group>,
}

pub struct Pipeline<R = ArchiveIdReader, M = GroupMerger, C = Cleaner> {
    store: ArchiveStore,
    pool: WorkerPool,
    id_reader: R,
    merger: M,
    cleaner: C,
}

impl Pipeline {
    /// The production pipeline over the configured archive trees.
    pub fn from_config(
        config: &PipelineConfig,
        filters: Vec<Box<dyn EventFilter>>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let store = config.store();
        Pipeline::new(
            store.clone(),
            config.workers,
            ArchiveIdReader::new(),
            GroupMerger::new(store.clone()),
            Cleaner::new(store, filters),
        )
    }
}

impl<R, M, C> Pipeline<R, M, C>
where
    R: IdReader,
    M: Merger,
    C: ArchiveCleaner,
{
    pub fn new(
        store: ArchiveStore,
        workers: usize,
        id_reader: R,
        merger: M,
        cleaner: C,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            store,
            pool: WorkerPool::new(workers)?,
            id_reader,
            merger,
            cleaner,
        })
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    /// Phase 1: identifier set of every raw archive.
    ///
    /// Returns only after every worker is done, so the map is complete.
    pub fn read_identifiers(
        &self,
        archives: &[ArchiveHandle],
    ) -> Result<FxHashMap<ArchiveHandle, IdentifierSet>, PipelineError> {
        tracing::info!(archives = archives.len(), "reading ids");
        let found: Mutex<FxHashMap<ArchiveHandle, IdentifierSet>> =
            Mutex::new(FxHashMap::default());

        self.pool.run_phase("read ids", archives.to_vec(), |ctx, archive| {
            tracing::info!(
                "({}) Reading archive {}/{} ({:.2}% started): {}",
                ctx.worker,
                ctx.position,
                ctx.total,
                ctx.percent_started(),
                archive
            );
            let ids = self.id_reader.read(&self.store.raw_path(&archive))?;
            let mut found = found
                .lock()
                .map_err(|_| PipelineError::Worker("identifier map lock poisoned".to_string()))?;
            if found.insert(archive.clone(), ids).is_some() {
                return Err(PipelineError::integrity(format!(
                    "archive {} was read twice",
                    archive
                )));
            }
            Ok(())
        })?;

        found
            .into_inner()
            .map_err(|_| PipelineError::Worker("identifier map lock poisoned".to_string()))
    }

    /// Phases 1 and 2 over everything in the raw tree.
    pub fn group(&self) -> Result<Grouping, PipelineError> {
        let archives = self.store.find_raw_archives()?;
        let archive_ids = self.read_identifiers(&archives)?;

        tracing::info!("grouping archives by ids");
        for (archive, ids) in archive_ids.iter() {
            tracing::debug!(archive = %archive, ids = ?ids, "identifiers");
        }
        let distinct_identifiers = archive_ids
            .values()
            .flatten()
            .collect::<FxHashSet<_>>()
            .len();

        let groups = group_related_archives(&archive_ids);
        validate_partition(&groups, &archives)?;
        for group in &groups {
            tracing::debug!(
                representative = %group.representative(),
                archives = ?group.archives(),
                "group"
            );
        }

        Ok(Grouping {
            archives,
            distinct_identifiers,
            groups,
        })
    }

    /// Phase 3 alone: one merged archive per group.
    pub fn merge_groups(&self, groups: Vec<Group>) -> Result<Vec<ArchiveHandle>, PipelineError> {
        tracing::info!(groups = groups.len(), "merging groups");
        let claimed = Mutex::new(FxHashSet::default());
        let mut merged = self.pool.run_phase("merge", groups, |ctx, group| {
            log_merging(ctx, &group);
            let archive = self.merger.merge(&group)?;
            claim(&claimed, &archive)?;
            Ok(archive)
        })?;
        merged.sort();
        Ok(merged)
    }

    /// Phase 4 alone: one final archive per merged archive.
    pub fn clean_archives(&self, merged: Vec<ArchiveHandle>) -> Result<Vec<CleanReport>, PipelineError> {
        tracing::info!(archives = merged.len(), "cleaning archives");
        let mut reports = self.pool.run_phase("clean", merged, |ctx, archive| {
            log_cleaning(ctx, &archive);
            self.cleaner.clean(&archive)
        })?;
        reports.sort_by(|a, b| a.archive.cmp(&b.archive));
        Ok(reports)
    }

    /// Phases 3 and 4 in one pass over the pool.
    ///
    /// The worker that merges a group cleans the merged archive right away,
    /// so a group never waits for other groups' merges.
    pub fn merge_and_clean(
        &self,
        groups: Vec<Group>,
    ) -> Result<(Vec<ArchiveHandle>, Vec<CleanReport>), PipelineError> {
        tracing::info!(groups = groups.len(), "merging and cleaning groups");
        let claimed = Mutex::new(FxHashSet::default());
        let mut done = self.pool.run_phase("merge and clean", groups, |ctx, group| {
            log_merging(ctx, &group);
            let archive = self.merger.merge(&group)?;
            claim(&claimed, &archive)?;

            log_cleaning(ctx, &archive);
            let report = self.cleaner.clean(&archive)?;
            Ok((archive, report))
        })?;
        done.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(done.into_iter().unzip())
    }

    pub fn run(&self) -> Result<RunSummary, PipelineError> {
        let start = Instant::now();
        tracing::info!(
            workers = self.pool.size(),
            raw = %self.store.raw_dir().display(),
            merged = %self.store.merged_dir().display(),
            final_dir = %self.store.final_dir().display(),
            "starting consolidation run"
        );

        let grouping = self.group()?;
        let group_count = grouping.groups.len();
        let (merged, reports) = self.merge_and_clean(grouping.groups)?;

        let summary = RunSummary {
            workers: self.pool.size(),
            archives_read: grouping.archives.len(),
            distinct_identifiers: grouping.distinct_identifiers,
            groups: group_count,
            merged: merged.len(),
            cleaned: reports.len(),
            events_before_cleaning: reports.iter().map(|r| r.before).sum(),
            events_after_cleaning: reports.iter().map(|r| r.after_ordering).sum(),
            reports,
        };

        tracing::info!(
            archives = summary.archives_read,
            groups = summary.groups,
            cleaned = summary.cleaned,
            events = summary.events_after_cleaning,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "consolidation run complete"
        );
        Ok(summary)
    }
}

fn log_merging(ctx: TaskContext, group: &Group) {
    tracing::info!(
        "({}) Merging group {}/{} ({:.1}% started), contains {} archives",
        ctx.worker,
        ctx.position,
        ctx.total,
        ctx.percent_started(),
        group.len()
    );
}

fn log_cleaning(ctx: TaskContext, archive: &ArchiveHandle) {
    tracing::info!(
        "({}) Cleaning archive {}/{} ({:.1}% started): {}",
        ctx.worker,
        ctx.position,
        ctx.total,
        ctx.percent_started(),
        archive
    );
}

/// Two groups must never share a merged path.
fn claim(claimed: &Mutex<FxHashSet<ArchiveHandle>>, archive: &ArchiveHandle) -> Result<(), PipelineError> {
    let fresh = claimed
        .lock()
        .map_err(|_| PipelineError::Worker("merged path set lock poisoned".to_string()))?
        .insert(archive.clone());
    if !fresh {
        return Err(PipelineError::integrity(format!(
            "two groups were merged into {}",
            archive
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::write_archive;
    use crate::event::EventRecord;
    use std::path::Path;

    const WORKERS: usize = 4;
    const GROUPS: usize = 10;
    const ARCHIVES_PER_GROUP: usize = 100;

    /// `zip_<g>_<i>` carries a private id and the shared id `zip_<g>`.
    fn expected_archives() -> Vec<ArchiveHandle> {
        let mut archives: Vec<ArchiveHandle> = (0..GROUPS)
            .flat_map(|g| (0..ARCHIVES_PER_GROUP).map(move |i| ArchiveHandle::new(format!("zip_{}_{}", g, i))))
            .collect();
        archives.sort();
        archives
    }

    fn shared_id(archive: &str) -> String {
        archive.rsplitn(2, '_').nth(1).unwrap_or(archive).to_string()
    }

    struct NameIdReader;

    impl IdReader for NameIdReader {
        fn read(&self, archive: &Path) -> Result<IdentifierSet, PipelineError> {
            let name = archive.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            Ok([format!("{}_private", name), shared_id(name)].into_iter().collect())
        }
    }

    #[derive(Default)]
    struct RecordingMerger {
        groups: Mutex<Vec<Group>>,
    }

    impl Merger for RecordingMerger {
        fn merge(&self, group: &Group) -> Result<ArchiveHandle, PipelineError> {
            self.groups.lock().unwrap().push(group.clone());
            Ok(group.representative().clone())
        }
    }

    #[derive(Default)]
    struct RecordingCleaner {
        cleaned: Mutex<Vec<ArchiveHandle>>,
    }

    impl ArchiveCleaner for RecordingCleaner {
        fn clean(&self, archive: &ArchiveHandle) -> Result<CleanReport, PipelineError> {
            self.cleaned.lock().unwrap().push(archive.clone());
            Ok(CleanReport {
                archive: archive.clone(),
                before: 2,
                after_dedup: 1,
                after_filters: Vec::new(),
                after_ordering: 1,
            })
        }
    }

    struct CrashingIdReader;

    impl IdReader for CrashingIdReader {
        fn read(&self, _archive: &Path) -> Result<IdentifierSet, PipelineError> {
            Err("test exception".into())
        }
    }

    struct CrashingMerger;

    impl Merger for CrashingMerger {
        fn merge(&self, _group: &Group) -> Result<ArchiveHandle, PipelineError> {
            Err(PipelineError::integrity("missing raw archive"))
        }
    }

    struct CrashingCleaner;

    impl ArchiveCleaner for CrashingCleaner {
        fn clean(&self, _archive: &ArchiveHandle) -> Result<CleanReport, PipelineError> {
            Err(PipelineError::Filter {
                filter: "test".to_string(),
                reason: "test exception".to_string(),
            })
        }
    }

    /// Creates an empty raw archive for every expected handle.
    fn raw_tree(base: &Path) -> ArchiveStore {
        let store = ArchiveStore::new(base.join("raw"), base.join("merged"), base.join("final"));
        for archive in expected_archives() {
            write_archive(&store.raw_path(&archive), &[]).unwrap();
        }
        store
    }

    #[test]
    fn test_all_values_are_completely_processed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = raw_tree(temp_dir.path());
        let pipeline = Pipeline::new(
            store,
            WORKERS,
            NameIdReader,
            RecordingMerger::default(),
            RecordingCleaner::default(),
        )
        .unwrap();

        let summary = pipeline.run().unwrap();

        assert_eq!(summary.archives_read, GROUPS * ARCHIVES_PER_GROUP);
        assert_eq!(summary.groups, GROUPS);
        assert_eq!(summary.merged, GROUPS);
        assert_eq!(summary.cleaned, GROUPS);
        assert_eq!(summary.distinct_identifiers, GROUPS * ARCHIVES_PER_GROUP + GROUPS);
        assert_eq!(summary.events_before_cleaning, 2 * GROUPS);
        assert_eq!(summary.events_after_cleaning, GROUPS);

        let merged_groups = pipeline.merger.groups.lock().unwrap();
        assert_eq!(merged_groups.len(), GROUPS);
        for group in merged_groups.iter() {
            assert_eq!(group.len(), ARCHIVES_PER_GROUP);
            let shared = shared_id(group.representative().as_str());
            assert!(group.archives().iter().all(|a| shared_id(a.as_str()) == shared));
        }

        let mut cleaned = pipeline.cleaner.cleaned.lock().unwrap().clone();
        cleaned.sort();
        let mut representatives: Vec<_> = merged_groups.iter().map(|g| g.representative().clone()).collect();
        representatives.sort();
        assert_eq!(cleaned, representatives);
    }

    #[test]
    fn test_identifier_map_is_complete_after_phase_one() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = raw_tree(temp_dir.path());
        let pipeline = Pipeline::new(
            store,
            WORKERS,
            NameIdReader,
            RecordingMerger::default(),
            RecordingCleaner::default(),
        )
        .unwrap();

        let archives = expected_archives();
        let ids = pipeline.read_identifiers(&archives).unwrap();

        assert_eq!(ids.len(), archives.len());
        for archive in &archives {
            assert!(ids[archive].contains(&shared_id(archive.as_str())));
        }
    }

    #[test]
    fn test_errors_in_id_reading_abort_the_run() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            raw_tree(temp_dir.path()),
            WORKERS,
            CrashingIdReader,
            RecordingMerger::default(),
            RecordingCleaner::default(),
        )
        .unwrap();

        let err = pipeline.run().unwrap_err();
        assert_eq!(err.to_string(), "Error: test exception");
        assert!(pipeline.merger.groups.lock().unwrap().is_empty());
    }

    #[test]
    fn test_errors_in_merging_abort_the_run() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            raw_tree(temp_dir.path()),
            WORKERS,
            NameIdReader,
            CrashingMerger,
            RecordingCleaner::default(),
        )
        .unwrap();

        assert!(pipeline.run().unwrap_err().is_integrity());
        assert!(pipeline.cleaner.cleaned.lock().unwrap().is_empty());
    }

    #[test]
    fn test_errors_in_cleaning_abort_the_run() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            raw_tree(temp_dir.path()),
            WORKERS,
            NameIdReader,
            RecordingMerger::default(),
            CrashingCleaner,
        )
        .unwrap();

        assert!(matches!(pipeline.run(), Err(PipelineError::Filter { .. })));
    }

    #[test]
    fn test_merging_into_the_same_path_twice_is_rejected() {
        struct ConstantMerger;

        impl Merger for ConstantMerger {
            fn merge(&self, _group: &Group) -> Result<ArchiveHandle, PipelineError> {
                Ok("same".into())
            }
        }

        let temp_dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            raw_tree(temp_dir.path()),
            WORKERS,
            NameIdReader,
            ConstantMerger,
            RecordingCleaner::default(),
        )
        .unwrap();

        assert!(pipeline.run().unwrap_err().is_integrity());
    }

    /// Holds the merge of `a_1` until some other archive has been cleaned.
    struct WaitingMerger {
        cleaned: crossbeam_channel::Receiver<ArchiveHandle>,
    }

    impl Merger for WaitingMerger {
        fn merge(&self, group: &Group) -> Result<ArchiveHandle, PipelineError> {
            if group.representative().as_str() == "a_1" {
                let other = self
                    .cleaned
                    .recv_timeout(std::time::Duration::from_secs(10))
                    .map_err(|_| PipelineError::integrity("no other group was cleaned meanwhile"))?;
                assert_eq!(other.as_str(), "b_1");
            }
            Ok(group.representative().clone())
        }
    }

    struct SignallingCleaner {
        cleaned: crossbeam_channel::Sender<ArchiveHandle>,
    }

    impl ArchiveCleaner for SignallingCleaner {
        fn clean(&self, archive: &ArchiveHandle) -> Result<CleanReport, PipelineError> {
            if archive.as_str() != "a_1" {
                self.cleaned
                    .send(archive.clone())
                    .map_err(|_| PipelineError::Worker("merger went away".to_string()))?;
            }
            Ok(CleanReport {
                archive: archive.clone(),
                before: 0,
                after_dedup: 0,
                after_filters: Vec::new(),
                after_ordering: 0,
            })
        }
    }

    #[test]
    fn test_groups_are_cleaned_without_waiting_for_other_merges() {
        let temp_dir = tempfile::tempdir().unwrap();
        let base = temp_dir.path();
        let store = ArchiveStore::new(base.join("raw"), base.join("merged"), base.join("final"));
        for archive in ["a_1", "a_2", "b_1", "b_2"] {
            write_archive(&store.raw_path(&archive.into()), &[]).unwrap();
        }
        let (sender, receiver) = crossbeam_channel::unbounded();
        let pipeline = Pipeline::new(
            store,
            2,
            NameIdReader,
            WaitingMerger { cleaned: receiver },
            SignallingCleaner { cleaned: sender },
        )
        .unwrap();

        let summary = pipeline.run().unwrap();

        assert_eq!(summary.groups, 2);
        let cleaned: Vec<&str> = summary.reports.iter().map(|r| r.archive.as_str()).collect();
        assert_eq!(cleaned, vec!["a_1", "b_1"]);
    }

    #[test]
    fn test_separate_phases_match_the_combined_pass() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            raw_tree(temp_dir.path()),
            WORKERS,
            NameIdReader,
            RecordingMerger::default(),
            RecordingCleaner::default(),
        )
        .unwrap();

        let groups = pipeline.group().unwrap().groups;
        let merged = pipeline.merge_groups(groups).unwrap();
        let reports = pipeline.clean_archives(merged.clone()).unwrap();

        assert_eq!(merged.len(), GROUPS);
        assert!(merged.windows(2).all(|w| w[0] < w[1]));
        let cleaned: Vec<ArchiveHandle> = reports.iter().map(|r| r.archive.clone()).collect();
        assert_eq!(cleaned, merged);
    }

    #[test]
    fn test_empty_raw_tree_is_a_successful_empty_run() {
        let temp_dir = tempfile::tempdir().unwrap();
        let base = temp_dir.path();
        std::fs::create_dir_all(base.join("raw")).unwrap();
        let store = ArchiveStore::new(base.join("raw"), base.join("merged"), base.join("final"));
        let pipeline = Pipeline::new(
            store,
            2,
            NameIdReader,
            RecordingMerger::default(),
            RecordingCleaner::default(),
        )
        .unwrap();

        let summary = pipeline.run().unwrap();
        assert_eq!(summary.archives_read, 0);
        assert_eq!(summary.groups, 0);
        assert!(summary.reports.is_empty());
    }

    #[test]
    fn test_real_components_end_to_end() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::from_base_dir(temp_dir.path().to_path_buf()).with_workers(2);
        let store = config.store();
        write_archive(
            &store.raw_path(&"a.zip".into()),
            &[EventRecord::new("0", 2, "command", "x"), EventRecord::new("1", 1, "command", "y")],
        )
        .unwrap();
        write_archive(
            &store.raw_path(&"b.zip".into()),
            &[EventRecord::new("1", 1, "command", "y")],
        )
        .unwrap();

        let summary = Pipeline::from_config(&config, Vec::new()).unwrap().run().unwrap();

        assert_eq!(summary.groups, 1);
        assert_eq!(summary.reports[0].archive.as_str(), "a.zip");
        assert_eq!(summary.reports[0].before, 3);
        assert_eq!(summary.reports[0].after_ordering, 2);
    }
}
