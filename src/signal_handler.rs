use std::thread;

use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};
use tracing::warn;

use crate::exit::ExitCallbacks;

/// Route SIGINT, SIGTERM and SIGHUP through the exit callbacks so the lock
/// is released and children are reaped on external termination. The process
/// exits with 128 plus the signal number.
pub fn signal_handler(callbacks: &ExitCallbacks) {
    let callbacks = callbacks.clone();
    thread::spawn(move || {
        let mut signals = match Signals::new([SIGINT, SIGTERM, SIGHUP]) {
            Ok(signals) => signals,
            Err(err) => {
                eprintln!("signal handler setup failed: {}", err);
                return;
            }
        };
        if let Some(signal) = signals.forever().next() {
            warn!(signal, "terminating on signal");
            callbacks.controlled_exit(128 + signal);
        }
    });
}
