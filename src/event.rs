use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Session identifiers referenced by the events of one archive.
pub type IdentifierSet = BTreeSet<String>;

/// One recorded interaction event.
///
/// Equality and hashing cover every field, so two records are duplicates
/// exactly when they are value-equal. Ordering for cleaning only looks at
/// `triggered_at`.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Encode, Decode, Serialize, Deserialize)]
pub struct EventRecord {
    pub session_id: String,
    /// Milliseconds since the unix epoch.
    pub triggered_at: i64,
    pub kind: String,
    pub payload: String,
}

impl EventRecord {
    pub fn new(
        session_id: impl Into<String>,
        triggered_at: i64,
        kind: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        EventRecord {
            session_id: session_id.into(),
            triggered_at,
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    pub fn has_session(&self) -> bool {
        !self.session_id.is_empty()
    }
}
