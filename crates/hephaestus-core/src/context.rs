//! Run and operation correlation identifiers.
//!
//! A `RunContext` is created at the entry of every command or API call and
//! carried explicitly into telemetry and audit calls. Nested operations derive
//! a child context that keeps the run ID but gets a fresh operation ID.

use serde::{Deserialize, Serialize};

/// Correlation identifiers bound for the lifetime of one top-level invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    /// Stable across the whole invocation, including nested operations.
    pub run_id: String,
    /// Name of the operation this context belongs to (e.g. `guard-rails`).
    pub operation: String,
    /// Unique per operation scope; children get their own.
    pub operation_id: String,
}

impl RunContext {
    /// Create a fresh context at an entry point (CLI command, API handler).
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            operation: operation.into(),
            operation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Derive a nested scope: same run ID, fresh operation ID.
    pub fn child(&self, operation: impl Into<String>) -> Self {
        Self {
            run_id: self.run_id.clone(),
            operation: operation.into(),
            operation_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_run_id_with_fresh_operation_id() {
        let parent = RunContext::new("guard-rails");
        let child = parent.child("cleanup");
        assert_eq!(parent.run_id, child.run_id);
        assert_eq!(child.operation, "cleanup");
        assert_ne!(parent.operation_id, child.operation_id);
    }
}
