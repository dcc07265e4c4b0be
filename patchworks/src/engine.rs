//! Commands that run the engine: `render`, `reconcile` and `sync`.

use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use patchworks_controller::{Controller, ControllerConfig, InterruptState, Reconciler};
use patchworks_core::NamespacedName;

use crate::{application, options::Options};

#[derive(clap::Parser, Debug)]
pub(crate) struct PatchArgs {
    /// The patch, as `NAMESPACE/NAME` or `NAME` in the default namespace
    name: NamespacedName,
}

#[derive(clap::Parser, Debug)]
pub(crate) struct SyncArgs {
    /// Keep running and react to changes until interrupted
    #[arg(long)]
    watch: bool,

    #[arg(long, default_value_t = ControllerConfig::default().max_concurrent_reconciles)]
    max_concurrent_reconciles: usize,

    /// Give up on a patch after this many consecutive failures (0: never)
    #[arg(long, default_value_t = 5)]
    max_retries: u32,

    /// Delay before the first retry, in milliseconds
    #[arg(long, default_value_t = 100)]
    base_backoff_ms: u64,

    /// Upper bound for the retry delay, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    max_backoff_ms: u64,

    /// Abandon a single reconcile after this many milliseconds (0: never)
    #[arg(long, default_value_t = 0)]
    reconcile_timeout_ms: u64,
}

impl SyncArgs {
    fn config(&self) -> ControllerConfig {
        ControllerConfig {
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_retries: (self.max_retries > 0).then_some(self.max_retries),
            reconcile_timeout: (self.reconcile_timeout_ms > 0)
                .then(|| Duration::from_millis(self.reconcile_timeout_ms)),
        }
    }
}

pub(crate) async fn render(
    options: &Options,
    interrupt_state: &InterruptState,
    args: &PatchArgs,
) -> Result<()> {
    let reconciler = Reconciler::new(application::engine_context(options)?);
    let Some(patch) = reconciler.load(&args.name, interrupt_state).await? else {
        bail!("patch {} not found", args.name);
    };
    let rendered = reconciler
        .render(&patch, interrupt_state)
        .await
        .with_context(|| format!("rendering patch {}", args.name))?;
    print!("{}", rendered);
    if !rendered.ends_with('\n') {
        println!();
    }
    Ok(())
}

pub(crate) async fn reconcile(
    options: &Options,
    interrupt_state: &InterruptState,
    args: &PatchArgs,
) -> Result<()> {
    let reconciler = Reconciler::new(application::engine_context(options)?);
    let outcome = reconciler
        .reconcile(&args.name, interrupt_state)
        .await
        .with_context(|| format!("reconciling patch {}", args.name))?;
    println!("{}: {}", args.name, outcome);
    if outcome.requeue() {
        eprintln!("Run `patchworks reconcile {}` again to continue.", args.name);
    }
    Ok(())
}

pub(crate) async fn sync(
    options: &Options,
    interrupt_state: &InterruptState,
    args: &SyncArgs,
) -> Result<()> {
    let controller = Controller::new(application::engine_context(options)?, args.config());
    let report = if args.watch {
        controller.run(interrupt_state).await
    } else {
        controller.run_until_idle(interrupt_state).await
    }
    .context("running the controller")?;

    eprintln!("{} reconcile(s) succeeded", report.reconciled);
    if !report.failed.is_empty() {
        for (name, error) in &report.failed {
            eprintln!("  {}: {}", name, error);
        }
        bail!("{} patch(es) could not be reconciled", report.failed.len());
    }
    Ok(())
}
