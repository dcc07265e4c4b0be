//! The lifecycle of a `Patch`.
//!
//! ```text
//! no finalizer ──add──▶ active (apply on every reconcile)
//!                          │ deletion requested
//!                          ▼
//!                      reverting ──restore target, drop finalizer──▶ removed
//! ```
//!
//! Every step is idempotent, so a reconcile may be repeated or interrupted at
//! any point and picked up again by the next one.

use std::fmt::Display;

use patchworks_core::{patch::TargetRef, NamespacedName, Patch};
use tracing::{debug, info, info_span, Instrument as _};

use crate::{
    applier::{self, Reverted},
    events::Reason,
    source, template, Context, Error, InterruptState, Result,
};

/// What a reconcile did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The patch does not exist (anymore).
    NotFound,
    /// The finalizer was attached. Reconcile again to apply.
    FinalizerAdded,
    Applied { patch_id: String },
    /// The target was reverted and the finalizer released.
    Reverted(Reverted),
    /// The patch is being deleted and is not ours to clean up.
    AlreadyRemoved,
}

impl Outcome {
    /// Whether the patch needs another reconcile right away.
    pub fn requeue(&self) -> bool {
        matches!(self, Outcome::FinalizerAdded)
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::NotFound => write!(f, "not found"),
            Outcome::FinalizerAdded => write!(f, "finalizer added"),
            Outcome::Applied { patch_id } => write!(f, "applied (patch id {})", patch_id),
            Outcome::Reverted(r) => write!(f, "reverted: {}", r),
            Outcome::AlreadyRemoved => write!(f, "already removed"),
        }
    }
}

/// The target with its namespace defaulted to the patch's own.
pub fn effective_target(patch: &Patch) -> TargetRef {
    let mut target = patch.spec.target.clone();
    if target.namespace.is_empty() {
        target.namespace = patch.metadata.namespace.clone();
    }
    target
}

pub struct Reconciler {
    ctx: Context,
}

impl Reconciler {
    pub fn new(ctx: Context) -> Self {
        Reconciler { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub async fn reconcile(
        &self,
        name: &NamespacedName,
        interrupt: &InterruptState,
    ) -> Result<Outcome> {
        self.reconcile_inner(name, interrupt)
            .instrument(info_span!("reconcile", patch = %name))
            .await
    }

    async fn reconcile_inner(
        &self,
        name: &NamespacedName,
        interrupt: &InterruptState,
    ) -> Result<Outcome> {
        let Some(mut patch) = self.load(name, interrupt).await? else {
            debug!("patch not found, nothing to do");
            return Ok(Outcome::NotFound);
        };

        match (patch.is_deleting(), patch.has_finalizer()) {
            (false, false) => {
                patch.add_finalizer();
                self.persist(&patch, interrupt).await?;
                debug!("added finalizer");
                Ok(Outcome::FinalizerAdded)
            }
            (false, true) => self.apply(&patch, interrupt).await,
            (true, true) => self.revert(patch, interrupt).await,
            (true, false) => Ok(Outcome::AlreadyRemoved),
        }
    }

    /// Reads the current patch. A missing patch is not an error.
    pub async fn load(
        &self,
        name: &NamespacedName,
        interrupt: &InterruptState,
    ) -> Result<Option<Patch>> {
        interrupt.check_interrupted()?;
        let object = match self.ctx.store.get(&Patch::key_for(name)).await {
            Ok(o) => o,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => {
                return Err(Error::PatchFetchFailed {
                    name: name.clone(),
                    source: e,
                })
            }
        };
        Patch::from_object(object)
            .map(Some)
            .map_err(|e| Error::InvalidPatchResource {
                name: name.clone(),
                source: e,
            })
    }

    /// Resolves the source and renders the template, without writing
    /// anything.
    pub async fn render(&self, patch: &Patch, interrupt: &InterruptState) -> Result<String> {
        let target = effective_target(patch);
        let data = source::resolve(
            self.ctx.store.as_ref(),
            &patch.spec.source,
            &target.namespace,
            interrupt,
        )
        .await?;
        Ok(template::render(&patch.spec.template, &data)?)
    }

    async fn apply(&self, patch: &Patch, interrupt: &InterruptState) -> Result<Outcome> {
        let key = patch.key();
        self.ctx.events.record(
            &key,
            Reason::PatchProcessing,
            "Processing patch for target resource",
        );

        let rendered = self
            .render(patch, interrupt)
            .await
            .inspect_err(|e| self.failed(patch, Reason::TemplateRenderFailed, e))?;

        let target = effective_target(patch);
        let applied = applier::apply(self.ctx.store.as_ref(), &target, &rendered, interrupt)
            .await
            .inspect_err(|e| self.failed(patch, Reason::PatchFailed, e))?;

        info!(object = %target.key(), patch_id = %applied.patch_id, "applied patch");
        self.ctx.events.record(
            &key,
            Reason::PatchApplied,
            &format!("Applied patch {} to {}", applied.patch_id, target.key()),
        );
        Ok(Outcome::Applied {
            patch_id: applied.patch_id,
        })
    }

    async fn revert(&self, mut patch: Patch, interrupt: &InterruptState) -> Result<Outcome> {
        let target = effective_target(&patch);
        let reverted = applier::revert(self.ctx.store.as_ref(), &target, interrupt)
            .await
            .inspect_err(|e| self.failed(&patch, Reason::RevertFailed, e))?;

        patch.remove_finalizer();
        self.persist(&patch, interrupt)
            .await
            .inspect_err(|e| self.failed(&patch, Reason::RevertFailed, e))?;

        info!(object = %target.key(), "{}", reverted);
        self.ctx.events.record(
            &patch.key(),
            Reason::PatchReverted,
            &format!("Reverted {}: {}", target.key(), reverted),
        );
        Ok(Outcome::Reverted(reverted))
    }

    async fn persist(&self, patch: &Patch, interrupt: &InterruptState) -> Result<()> {
        interrupt.check_interrupted()?;
        self.ctx
            .store
            .update(patch.to_object())
            .await
            .map_err(|e| Error::PersistFailed {
                name: patch.namespaced_name(),
                source: e,
            })?;
        Ok(())
    }

    fn failed(&self, patch: &Patch, reason: Reason, error: &Error) {
        if error.is_cancelled() {
            return;
        }
        self.ctx
            .events
            .record(&patch.key(), reason, &error.chain());
    }
}
