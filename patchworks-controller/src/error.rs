use patchworks_core::{CoreError, NamespacedName, ObjectKey};
use patchworks_store::StoreError;

use crate::{interrupt::InterruptedError, template::TemplateError};

/// Everything a reconcile can fail with.
///
/// None of these are retried here; the caller decides when to try again.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load patch {name}")]
    PatchFetchFailed {
        name: NamespacedName,
        #[source]
        source: StoreError,
    },
    #[error("patch {name} is invalid")]
    InvalidPatchResource {
        name: NamespacedName,
        #[source]
        source: CoreError,
    },
    #[error("unsupported source kind: {0}")]
    UnsupportedSourceKind(String),
    #[error("source {0} not found")]
    SourceNotFound(ObjectKey),
    #[error("failed to read source {key}")]
    SourceFetchFailed {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("source {key} has invalid data: {reason}")]
    SourceDataInvalid { key: ObjectKey, reason: String },
    #[error("failed to parse template")]
    TemplateParse(#[source] TemplateError),
    #[error("failed to render template")]
    TemplateExec(#[source] TemplateError),
    #[error("rendered patch is not a valid YAML mapping: {0}")]
    PatchPayloadInvalid(String),
    #[error("invalid target reference {target}")]
    InvalidApiVersion {
        target: ObjectKey,
        #[source]
        source: CoreError,
    },
    #[error("failed to fetch target resource {target}")]
    TargetFetchFailed {
        target: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("failed to apply patch to {target}")]
    PatchApplyFailed {
        target: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("failed to restore {target}")]
    RevertFailed {
        target: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("failed to persist finalizer change on patch {name}")]
    PersistFailed {
        name: NamespacedName,
        #[source]
        source: StoreError,
    },
    #[error("failed to list patches")]
    ListFailed(#[source] StoreError),
    #[error("reconcile cancelled")]
    Cancelled(#[from] InterruptedError),
}

impl From<TemplateError> for Error {
    fn from(e: TemplateError) -> Self {
        match e {
            TemplateError::Parse { .. } => Error::TemplateParse(e),
            TemplateError::Exec { .. } => Error::TemplateExec(e),
        }
    }
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Whether a lookup found nothing. Only the patch itself and the target
    /// of a revert treat absence as success; everywhere else it is an error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::SourceNotFound(_) => true,
            Error::PatchFetchFailed { source, .. } | Error::TargetFetchFailed { source, .. } => {
                source.is_not_found()
            }
            _ => false,
        }
    }

    /// Whether the failure came from a write that lost an optimistic
    /// concurrency race.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::PatchApplyFailed { source, .. }
            | Error::RevertFailed { source, .. }
            | Error::PersistFailed { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// The message followed by the messages of all underlying causes.
    pub fn chain(&self) -> String {
        let mut s = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(e) = cause {
            s.push_str(": ");
            s.push_str(&e.to_string());
            cause = e.source();
        }
        s
    }
}

pub type Result<T> = std::result::Result<T, Error>;
