//! Coordinator shutdown.
//!
//! On SIGTERM/SIGINT the scheduler stops starting new ticks, while
//! seed steps already talking to agents hold a [`StepGuard`] and are
//! left to finish their current call. The guard count is what gets
//! reported when shutdown is requested mid-tick.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown flag shared between the signal listener, the scheduler
/// loop and in-flight seed steps.
#[derive(Clone)]
pub struct Shutdown {
    requested: Arc<watch::Sender<bool>>,
    in_flight_steps: Arc<AtomicUsize>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (requested, _) = watch::channel(false);
        Self {
            requested: Arc::new(requested),
            in_flight_steps: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Stop starting new work. Seed steps currently holding a guard
    /// finish their current agent or storage call. Safe to call more
    /// than once.
    pub fn request(&self) {
        let already = self.requested.send_replace(true);
        if !already {
            info!(
                in_flight_steps = self.in_flight_steps(),
                "shutdown requested; letting in-flight seed steps finish"
            );
        }
    }

    pub fn is_requested(&self) -> bool {
        *self.requested.borrow()
    }

    /// Resolves once shutdown has been requested; immediately if it
    /// already was.
    pub async fn wait(&self) {
        let mut rx = self.requested.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Mark one seed step as in flight for the lifetime of the guard.
    pub fn step_guard(&self) -> StepGuard {
        self.in_flight_steps.fetch_add(1, Ordering::SeqCst);
        StepGuard {
            in_flight_steps: self.in_flight_steps.clone(),
        }
    }

    /// Seed steps currently between guard creation and drop.
    pub fn in_flight_steps(&self) -> usize {
        self.in_flight_steps.load(Ordering::SeqCst)
    }

    /// Spawn the SIGTERM/SIGINT listener that flips the flag.
    pub fn listen_for_signals(&self) {
        let shutdown = self.clone();

        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "cannot install SIGTERM handler");
                    return;
                }
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "cannot install SIGINT handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = sigint.recv() => info!("SIGINT received"),
            }
            shutdown.request();
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by a seed step while it runs; dropping it releases the
/// in-flight slot.
pub struct StepGuard {
    in_flight_steps: Arc<AtomicUsize>,
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        self.in_flight_steps.fetch_sub(1, Ordering::SeqCst);
    }
}
