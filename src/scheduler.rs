use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::constants::{tick_duration_ms, MAX_CATCHUP_TICKS};
use crate::error::RuntimeError;

/// Something driven at a fixed rate on its own thread.
pub trait Steppable: Send + 'static {
    fn step(&mut self, now: Instant);
}

/// Runs `step` every `1 / tick_rate` seconds until `shutdown` is raised. Late ticks are
/// caught up to `MAX_CATCHUP_TICKS` at a time; beyond that the schedule is reset.
pub fn run_fixed_step<S: Steppable>(
    name: &str,
    tick_rate: u32,
    shutdown: &AtomicBool,
    steppable: &mut S,
) -> u64 {
    let period = Duration::from_millis(tick_duration_ms(tick_rate));
    let mut next = Instant::now();
    let mut ticks = 0_u64;

    while !shutdown.load(Ordering::Acquire) {
        let now = Instant::now();
        let mut ran = 0;
        while next <= now && ran < MAX_CATCHUP_TICKS {
            steppable.step(now);
            next += period;
            ran += 1;
            ticks += 1;
        }
        if next <= now {
            warn!(thread = name, behind_ms = (now - next).as_millis() as u64, "tick loop fell behind");
            next = now + period;
        }
        thread::sleep(next.saturating_duration_since(Instant::now()));
    }
    ticks
}

/// Spawns a named thread running [`run_fixed_step`].
pub fn spawn_fixed_step<S: Steppable>(
    name: String,
    tick_rate: u32,
    shutdown: Arc<AtomicBool>,
    mut steppable: S,
) -> Result<JoinHandle<()>, RuntimeError> {
    let thread_name = name.clone();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            info!(thread = %thread_name, tick_rate, "tick loop started");
            let ticks = run_fixed_step(&thread_name, tick_rate, &shutdown, &mut steppable);
            info!(thread = %thread_name, ticks, "tick loop stopped");
        })
        .map_err(|source| RuntimeError::Spawn { name, source })
}
