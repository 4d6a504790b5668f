use crate::event::EventRecord;
use crate::PipelineError;
use std::collections::BTreeSet;

/// A named, pure predicate applied by the cleaner.
///
/// `keep` returns `Ok(false)` to drop the event. An `Err` aborts the run.
pub trait EventFilter: Send + Sync {
    fn name(&self) -> String;
    fn keep(&self, event: &EventRecord) -> Result<bool, PipelineError>;
}

/// Drops every event of one kind.
#[derive(Clone, Debug)]
pub struct KindFilter {
    kind: String,
}

impl KindFilter {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

impl EventFilter for KindFilter {
    fn name(&self) -> String {
        format!("kind filter: {}", self.kind)
    }

    fn keep(&self, event: &EventRecord) -> Result<bool, PipelineError> {
        Ok(event.kind != self.kind)
    }
}

/// Keeps events with `from <= triggered_at < to`; an absent bound is open.
#[derive(Clone, Debug)]
pub struct TimeWindowFilter {
    from: Option<i64>,
    to: Option<i64>,
}

impl TimeWindowFilter {
    pub fn new(from: Option<i64>, to: Option<i64>) -> Result<Self, PipelineError> {
        if let (Some(from), Some(to)) = (from, to) {
            if from >= to {
                return Err(PipelineError::Config(format!(
                    "empty time window: {} is not before {}",
                    from, to
                )));
            }
        }
        Ok(Self { from, to })
    }
}

impl EventFilter for TimeWindowFilter {
    fn name(&self) -> String {
        let bound = |b: Option<i64>| b.map(|v| v.to_string()).unwrap_or_default();
        format!("time window: {}..{}", bound(self.from), bound(self.to))
    }

    fn keep(&self, event: &EventRecord) -> Result<bool, PipelineError> {
        let after_start = self.from.map_or(true, |from| event.triggered_at >= from);
        let before_end = self.to.map_or(true, |to| event.triggered_at < to);
        Ok(after_start && before_end)
    }
}

/// Drops every event of the listed sessions.
#[derive(Clone, Debug)]
pub struct SessionFilter {
    sessions: BTreeSet<String>,
}

impl SessionFilter {
    pub fn new<I, S>(sessions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sessions: sessions.into_iter().map(Into::into).collect(),
        }
    }
}

impl EventFilter for SessionFilter {
    fn name(&self) -> String {
        format!("session filter: {} ids", self.sessions.len())
    }

    fn keep(&self, event: &EventRecord) -> Result<bool, PipelineError> {
        Ok(!self.sessions.contains(&event.session_id))
    }
}
