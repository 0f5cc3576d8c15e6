use std::fmt;
use uuid::Uuid;

/// Token identifying one unit of work and its input/output artifact pair.
///
/// Generated fresh at submission time and never reused while its
/// artifacts exist. Array submissions derive one id per slot from a
/// common base with [`WorkerId::slot`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Id of array slot `index` derived from this base id.
    pub fn slot(&self, index: usize) -> Self {
        Self(format!("{}_{index}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier assigned by a scheduler backend.
///
/// Opaque to the executor, meaningful only to the backend that produced
/// it. An array submission yields one group id; the slots are addressed
/// as `"{group}_{index}"` via [`JobId::slot`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id of array slot `index` within this job group.
    pub fn slot(&self, index: usize) -> Self {
        Self(format!("{}_{index}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
