use crate::archive::ArchiveReader;
use crate::event::IdentifierSet;
use crate::PipelineError;
use std::path::Path;

/// Extracts the identifier set of one raw archive.
///
/// Implementations are shared by all phase-1 workers and must not keep
/// mutable state between calls.
pub trait IdReader: Sync {
    fn read(&self, archive: &Path) -> Result<IdentifierSet, PipelineError>;
}

/// Reads session identifiers straight from the archive's events.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArchiveIdReader;

impl ArchiveIdReader {
    pub fn new() -> Self {
        ArchiveIdReader
    }
}

impl IdReader for ArchiveIdReader {
    fn read(&self, archive: &Path) -> Result<IdentifierSet, PipelineError> {
        let mut ids = IdentifierSet::new();
        for record in ArchiveReader::open(archive)? {
            let record = record?;
            if record.has_session() {
                ids.insert(record.session_id);
            }
        }
        Ok(ids)
    }
}
