//! Object model shared by the `patchworks` store, engine and command line.
//!
//! Objects are kept unstructured (a JSON tree) so that the engine can address
//! any kind of target. Only the [`patch::Patch`] resource has a typed view.

pub mod key;
pub mod object;
pub mod patch;

pub use key::{GroupVersion, NamespacedName, ObjectKey};
pub use object::Object;
pub use patch::Patch;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid apiVersion {0:?}")]
    InvalidApiVersion(String),
    #[error("invalid object name {0:?}: expected NAME or NAMESPACE/NAME")]
    InvalidName(String),
    #[error("object is missing required field {0}")]
    MissingField(&'static str),
    #[error("invalid Patch resource: {0}")]
    InvalidPatch(String),
    #[error("expected an object document, got {0}")]
    NotAnObject(&'static str),
}

pub type Result<T> = std::result::Result<T, CoreError>;
