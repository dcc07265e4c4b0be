//! The patchworks engine.
//!
//! A `Patch` names a data source, a template and a target object. Reconciling
//! it renders the template against the source, merges the result into the
//! target and tags the target with a snapshot of its previous state. When the
//! `Patch` is deleted the snapshot is restored.
//!
//! All durable state lives in the object store: the finalizer on the `Patch`
//! and the provenance annotations on the target. See [`reconciler`] for the
//! lifecycle.

pub mod applier;
pub mod error;
pub mod events;
pub mod interrupt;
pub mod reconciler;
pub mod runner;
pub mod snapshot;
pub mod source;
pub mod template;

use std::sync::Arc;

use patchworks_store::ObjectStore;

pub use error::{Error, Result};
pub use events::EventSink;
pub use interrupt::InterruptState;
pub use reconciler::{Outcome, Reconciler};
pub use runner::{Controller, ControllerConfig};

/// The collaborators a reconcile needs.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn ObjectStore>,
    pub events: Arc<dyn EventSink>,
}

impl Context {
    pub fn new(store: Arc<dyn ObjectStore>, events: Arc<dyn EventSink>) -> Self {
        Context { store, events }
    }
}
