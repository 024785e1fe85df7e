use std::fmt;

use capsule_core::{OwnerError, UnknownType};
use capsule_kubehub::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("step '{step}' failed: {error:#}")]
    Step { step: String, error: anyhow::Error },
    #[error(transparent)]
    UnknownType(#[from] UnknownType),
    #[error("could not load {key}: {error}")]
    Load { key: String, error: StoreError },
    #[error("could not set owner on {key}: {error}")]
    Owner { key: String, error: OwnerError },
    #[error("could not render {key}: {error}")]
    Render { key: String, error: StoreError },
    /// A dry run hit a resourceVersion conflict on an object this Capsule
    /// does not own. Nothing was written.
    #[error("new object version available for '{0}'")]
    Stale(String),
    /// An owned object changed underneath this attempt, through a lost
    /// create race or a conflicting dry-run update. Handled by the run loop;
    /// never returned from a run.
    #[error("owned object changed during the run: {0}")]
    RecoverableConflict(String),
    #[error(transparent)]
    Apply(ApplyErrors),
    #[error("could not publish status: {0}")]
    Publish(StoreError),
    #[error("retry limit reached after {attempts} attempts ({seen} objects seen)")]
    RetryExhausted { attempts: usize, seen: usize },
}

impl PipelineError {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    /// Whether the run loop records this error in the Capsule status.
    /// Apply errors are published by the commit itself.
    pub(crate) fn publishes_status(&self) -> bool {
        !matches!(
            self,
            Self::Stale(_) | Self::RecoverableConflict(_) | Self::Apply(_) | Self::Publish(_)
        )
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Step { .. } => "step",
            Self::UnknownType(_) => "unknown_type",
            Self::Load { .. } => "load",
            Self::Owner { .. } => "owner",
            Self::Render { .. } => "render",
            Self::Stale(_) => "stale",
            Self::RecoverableConflict(_) => "conflict",
            Self::Apply(_) => "apply",
            Self::Publish(_) => "publish",
            Self::RetryExhausted { .. } => "retry_exhausted",
        }
    }
}

/// Per-key apply failures of one commit, in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyErrors(pub Vec<String>);

impl ApplyErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ApplyErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("\n"))
    }
}

impl std::error::Error for ApplyErrors {}
