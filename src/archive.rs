use crate::event::EventRecord;
use crate::PipelineError;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Every archive starts with these bytes.
pub const ARCHIVE_MAGIC: &[u8; 8] = b"SMARCH01";

/// Upper bound on the encoded size of one record.
///
/// Decoding never allocates more than this for a single record, so a
/// corrupt length prefix fails as `CorruptArchive` instead of exhausting
/// memory. Writers refuse records above the cap.
pub const MAX_RECORD_BYTES: usize = 8 * 1024 * 1024;

fn record_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_RECORD_BYTES>()
}

/// Hidden sibling the writer fills before the archive is moved into place.
fn partial_path(path: &Path) -> Result<PathBuf, PipelineError> {
    let name = path.file_name().ok_or_else(|| {
        PipelineError::integrity(format!("archive path has no file name: {}", path.display()))
    })?;
    let mut partial = std::ffi::OsString::from(".");
    partial.push(name);
    partial.push(".partial");
    Ok(path.with_file_name(partial))
}

/// Appends records to a new archive file.
///
/// Records go to a hidden `.partial` sibling; `finish` flushes it and
/// renames it over the target. A writer dropped without `finish` removes
/// its partial file, so the target is either complete or untouched.
pub struct ArchiveWriter {
    path: PathBuf,
    partial: PathBuf,
    writer: BufWriter<File>,
    count: usize,
    finished: bool,
}

impl ArchiveWriter {
    pub fn create(path: &Path) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = partial_path(path)?;
        let file = File::create(&partial)?;
        let mut writer = ArchiveWriter {
            path: path.to_path_buf(),
            partial,
            writer: BufWriter::new(file),
            count: 0,
            finished: false,
        };
        writer.writer.write_all(ARCHIVE_MAGIC)?;
        Ok(writer)
    }

    pub fn append(&mut self, record: &EventRecord) -> Result<(), PipelineError> {
        let bytes = bincode::encode_to_vec(record, record_config())?;
        if bytes.len() > MAX_RECORD_BYTES {
            return Err(PipelineError::integrity(format!(
                "record of {} bytes exceeds the {} byte limit ({})",
                bytes.len(),
                MAX_RECORD_BYTES,
                self.path.display()
            )));
        }
        self.writer.write_all(&bytes)?;
        self.count += 1;
        Ok(())
    }

    pub fn append_all<'a, I>(&mut self, records: I) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = &'a EventRecord>,
    {
        for record in records {
            self.append(record)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush, move into place and return the number of records written.
    pub fn finish(mut self) -> Result<usize, PipelineError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        fs::rename(&self.partial, &self.path)?;
        self.finished = true;
        Ok(self.count)
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = fs::remove_file(&self.partial); // best effort
        }
    }
}

/// Sequential reader over the records of one archive, in append order.
pub struct ArchiveReader {
    path: PathBuf,
    reader: BufReader<File>,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                PipelineError::CorruptArchive(format!("{}: missing header", path.display()))
            } else {
                PipelineError::Io(e)
            }
        })?;
        if &magic != ARCHIVE_MAGIC {
            return Err(PipelineError::CorruptArchive(format!(
                "{}: bad header",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            reader,
        })
    }

    /// Next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<EventRecord>, PipelineError> {
        if self.reader.fill_buf()?.is_empty() {
            return Ok(None);
        }
        let record = bincode::decode_from_std_read::<EventRecord, _, _>(
            &mut self.reader,
            record_config(),
        )
        .map_err(|e| {
            PipelineError::CorruptArchive(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Some(record))
    }
}

impl Iterator for ArchiveReader {
    type Item = Result<EventRecord, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

pub fn read_archive(path: &Path) -> Result<Vec<EventRecord>, PipelineError> {
    ArchiveReader::open(path)?.collect()
}

pub fn write_archive(path: &Path, records: &[EventRecord]) -> Result<usize, PipelineError> {
    let mut writer = ArchiveWriter::create(path)?;
    writer.append_all(records)?;
    writer.finish()
}
