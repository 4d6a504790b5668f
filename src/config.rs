use crate::store::ArchiveStore;
use crate::PipelineError;
use std::path::PathBuf;

pub const STATE_DIR_ENV: &str = "SESSIONMERGE_STATE_DIR";
pub const WORKERS_ENV: &str = "SESSIONMERGE_WORKERS";
pub const DEFAULT_STATE_DIR: &str = "./sessionmerge_state";

/// Directory locations and pool size for one pipeline run
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub raw_dir: PathBuf,
    pub merged_dir: PathBuf,
    pub final_dir: PathBuf,
    pub workers: usize,
}

impl PipelineConfig {
    /// Defaults for production use, honoring the environment overrides
    pub fn from_env() -> Result<Self, PipelineError> {
        let base_dir = std::env::var(STATE_DIR_ENV).unwrap_or_else(|_| DEFAULT_STATE_DIR.to_string());
        let mut config = Self::from_base_dir(PathBuf::from(base_dir));
        if let Ok(workers) = std::env::var(WORKERS_ENV) {
            config.workers = parse_workers(&workers)?;
        }
        Ok(config)
    }

    /// `raw`, `merged` and `final` below one base directory
    pub fn from_base_dir(base_dir: PathBuf) -> Self {
        Self {
            raw_dir: base_dir.join("raw"),
            merged_dir: base_dir.join("merged"),
            final_dir: base_dir.join("final"),
            workers: default_workers(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.workers == 0 {
            return Err(PipelineError::Config("worker count must be at least 1".to_string()));
        }
        let roots = [&self.raw_dir, &self.merged_dir, &self.final_dir];
        for (i, a) in roots.iter().enumerate() {
            for b in roots.iter().skip(i + 1) {
                if a == b {
                    return Err(PipelineError::Config(format!(
                        "archive trees must be distinct, {} is used twice",
                        a.display()
                    )));
                }
            }
        }
        // no output tree below the raw tree
        for output in [&self.merged_dir, &self.final_dir] {
            if output.starts_with(&self.raw_dir) {
                return Err(PipelineError::Config(format!(
                    "{} must not be inside the raw tree {}",
                    output.display(),
                    self.raw_dir.display()
                )));
            }
        }
        Ok(())
    }

    pub fn store(&self) -> ArchiveStore {
        ArchiveStore::new(
            self.raw_dir.clone(),
            self.merged_dir.clone(),
            self.final_dir.clone(),
        )
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn parse_workers(value: &str) -> Result<usize, PipelineError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|e| PipelineError::Config(format!("{} must be a number: {}", WORKERS_ENV, e)))
}
