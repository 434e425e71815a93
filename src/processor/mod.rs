//! ProcessorInstance - identity of one running processor
//!
//! Generated at process start (or taken from `PROCESSOR_ID`) and stamped on
//! every batch this instance claims.

use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessorInstance {
    id: String,
}

impl ProcessorInstance {
    /// Fresh random identity
    pub fn generate() -> Self {
        Self {
            id: format!("proc-{}", Uuid::new_v4().simple()),
        }
    }

    /// Explicit identity if given, else a generated one
    pub fn from_config(id: Option<&str>) -> Self {
        match id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => Self { id: id.to_string() },
            None => Self::generate(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ProcessorInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
