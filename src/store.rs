use crate::PipelineError;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Relative path of one archive, shared by the raw, merged and final trees.
///
/// Components are joined with `/` so that ordering is a plain byte-wise
/// string comparison on every platform.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ArchiveHandle(String);

impl ArchiveHandle {
    pub fn new(rel: impl Into<String>) -> Self {
        let rel: String = rel.into();
        ArchiveHandle(rel.replace('\\', "/"))
    }

    /// Build a handle from a path relative to one of the roots.
    pub fn from_relative(rel: &Path) -> Result<Self, PipelineError> {
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                std::path::Component::Normal(part) => {
                    let part = part.to_str().ok_or_else(|| {
                        PipelineError::integrity(format!(
                            "archive path is not valid UTF-8: {}",
                            rel.display()
                        ))
                    })?;
                    parts.push(part);
                }
                std::path::Component::CurDir => {}
                _ => {
                    return Err(PipelineError::integrity(format!(
                        "archive path must be relative: {}",
                        rel.display()
                    )));
                }
            }
        }
        if parts.is_empty() {
            return Err(PipelineError::integrity("archive path is empty"));
        }
        Ok(ArchiveHandle(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve against a root directory.
    pub fn under(&self, root: &Path) -> PathBuf {
        self.0.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part))
    }
}

impl fmt::Display for ArchiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArchiveHandle {
    fn from(rel: &str) -> Self {
        ArchiveHandle::new(rel)
    }
}

/// The three archive trees the pipeline reads from and writes to.
#[derive(Clone, Debug)]
pub struct ArchiveStore {
    raw_dir: PathBuf,
    merged_dir: PathBuf,
    final_dir: PathBuf,
}

impl ArchiveStore {
    pub fn new(raw_dir: PathBuf, merged_dir: PathBuf, final_dir: PathBuf) -> Self {
        Self {
            raw_dir,
            merged_dir,
            final_dir,
        }
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    pub fn merged_dir(&self) -> &Path {
        &self.merged_dir
    }

    pub fn final_dir(&self) -> &Path {
        &self.final_dir
    }

    pub fn raw_path(&self, archive: &ArchiveHandle) -> PathBuf {
        archive.under(&self.raw_dir)
    }

    pub fn merged_path(&self, archive: &ArchiveHandle) -> PathBuf {
        archive.under(&self.merged_dir)
    }

    pub fn final_path(&self, archive: &ArchiveHandle) -> PathBuf {
        archive.under(&self.final_dir)
    }

    /// Every archive below the raw root, sorted byte-wise.
    ///
    /// Hidden files (leading `.`) are skipped.
    pub fn find_raw_archives(&self) -> Result<Vec<ArchiveHandle>, PipelineError> {
        if !self.raw_dir.is_dir() {
            return Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("raw directory does not exist: {}", self.raw_dir.display()),
            )));
        }

        let mut archives = Vec::new();
        for entry in WalkDir::new(&self.raw_dir).follow_links(true) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let hidden = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with('.'))
                .unwrap_or(false);
            if hidden {
                continue;
            }
            let rel = entry.path().strip_prefix(&self.raw_dir).map_err(|_| {
                PipelineError::integrity(format!(
                    "{} is not below {}",
                    entry.path().display(),
                    self.raw_dir.display()
                ))
            })?;
            archives.push(ArchiveHandle::from_relative(rel)?);
        }

        archives.sort();
        Ok(archives)
    }
}
