use anyhow::{Context as _, Result};
use patchworks_controller::InterruptState;

fn set_process_interrupt_handler(interrupted: &InterruptState) -> Result<()> {
    let interrupted = interrupted.clone();
    ctrlc::set_handler(move || {
        if interrupted.is_interrupted() {
            // Second Ctrl-C: the user does not want to wait for a clean stop.
            std::process::exit(130);
        }
        eprintln!("patchworks: interrupted, stopping after the current store call");
        interrupted.set_interrupted();
    })
    .context("setting interrupt handler")
}

pub fn set_up_process_interrupt_handler() -> Result<InterruptState> {
    let interrupt_state = InterruptState::new();
    set_process_interrupt_handler(&interrupt_state)?;
    Ok(interrupt_state)
}
