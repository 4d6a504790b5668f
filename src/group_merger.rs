use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::grouper::Group;
use crate::store::{ArchiveHandle, ArchiveStore};
use crate::PipelineError;

/// Combines the raw archives of one group into one merged archive.
pub trait Merger: Sync {
    /// Returns the handle the merged archive was written under.
    fn merge(&self, group: &Group) -> Result<ArchiveHandle, PipelineError>;
}

/// Concatenates the group's raw archives, in byte-wise path order, into
/// `merged/<representative>`. No other path of the group is written, and a
/// failed merge leaves no file at the representative path.
pub struct GroupMerger {
    store: ArchiveStore,
}

impl GroupMerger {
    pub fn new(store: ArchiveStore) -> Self {
        Self { store }
    }
}

impl Merger for GroupMerger {
    fn merge(&self, group: &Group) -> Result<ArchiveHandle, PipelineError> {
        if group.is_empty() {
            return Err(PipelineError::integrity("cannot merge an empty group"));
        }

        // fail on a missing member before anything is written
        for archive in group.archives() {
            let path = self.store.raw_path(archive);
            if !path.is_file() {
                return Err(PipelineError::integrity(format!(
                    "raw archive {} does not exist ({})",
                    archive,
                    path.display()
                )));
            }
        }

        let representative = group.representative().clone();
        let target = self.store.merged_path(&representative);
        let mut writer = ArchiveWriter::create(&target)?;

        for archive in group.archives() {
            for record in ArchiveReader::open(&self.store.raw_path(archive))? {
                writer.append(&record?)?;
            }
        }
        let written = writer.finish()?;

        tracing::debug!(
            archive = %representative,
            archives = group.len(),
            events = written,
            "merged group"
        );
        Ok(representative)
    }
}
