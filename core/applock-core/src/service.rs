//! Single consumer for detector messages.
//!
//! Every detector publishes into one channel; `LockService` drains it on one
//! worker thread so decisions are evaluated in arrival order. Tests and the
//! replay CLI call [`LockService::pump`] instead of spawning the worker.

use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::detectors::DetectorMessage;
use crate::engine::LockEngine;
use crate::error::{AppLockError, Result};
use crate::failover::FailoverController;
use crate::types::{BackendChoice, Decision};

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct LockService {
    engine: Arc<LockEngine>,
    failover: Arc<FailoverController>,
    receiver: Receiver<DetectorMessage>,
    worker: Mutex<Option<Worker>>,
}

impl LockService {
    pub fn new(
        engine: Arc<LockEngine>,
        failover: Arc<FailoverController>,
        receiver: Receiver<DetectorMessage>,
    ) -> Self {
        Self {
            engine,
            failover,
            receiver,
            worker: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<LockEngine> {
        &self.engine
    }

    pub fn failover(&self) -> &Arc<FailoverController> {
        &self.failover
    }

    /// Handles one message. Returns the decision when an event was
    /// evaluated.
    pub fn dispatch(&self, message: DetectorMessage) -> Option<Decision> {
        match message {
            DetectorMessage::Detected(event) => {
                if !self.failover.should_evaluate(event.source) {
                    tracing::trace!(
                        package = %event.package_id,
                        source = %event.source,
                        "Deferring to active backend"
                    );
                    return None;
                }
                Some(self.engine.process(&event))
            }
            DetectorMessage::Failed { backend, reason } => {
                self.handle_failure(backend, &reason);
                None
            }
            DetectorMessage::LauncherResolved(package) => {
                self.engine.add_launcher(&package);
                None
            }
        }
    }

    /// Drains whatever is queued right now, synchronously.
    pub fn pump(&self) -> Vec<Decision> {
        let mut decisions = Vec::new();
        while let Ok(message) = self.receiver.try_recv() {
            if let Some(decision) = self.dispatch(message) {
                decisions.push(decision);
            }
        }
        decisions
    }

    fn handle_failure(&self, backend: BackendChoice, reason: &str) {
        match self.failover.on_backend_failed(backend, reason) {
            Ok(active) => tracing::info!(failed = %backend, active = %active, "Failover complete"),
            Err(err) => tracing::error!(failed = %backend, error = %err, "Failover failed"),
        }
    }

    /// Starts the backends and the consumer thread.
    pub fn start(self: &Arc<Self>) -> Result<BackendChoice> {
        self.spawn_worker()?;
        match self.failover.start() {
            Ok(active) => Ok(active),
            Err(err) => {
                self.shutdown();
                Err(err)
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker();
        if worker.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let service = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("applock-service".to_string())
            .spawn(move || {
                tracing::info!("Lock service worker started");
                loop {
                    crossbeam_channel::select! {
                        recv(stop_rx) -> _ => break,
                        recv(service.receiver) -> message => match message {
                            Ok(message) => {
                                service.dispatch(message);
                            }
                            Err(_) => {
                                tracing::info!("All detector senders dropped; worker stopping");
                                break;
                            }
                        },
                    }
                }
            })
            .map_err(|source| AppLockError::ThreadSpawn {
                name: "applock-service".to_string(),
                source,
            })?;

        *worker = Some(Worker { stop_tx, handle });
        Ok(())
    }

    /// Stops every detector, then the consumer thread.
    pub fn shutdown(&self) {
        self.failover.stop_all();
        let Some(Worker { stop_tx, handle }) = self.worker().take() else {
            return;
        };
        let _ = stop_tx.send(());
        if handle.join().is_err() {
            tracing::warn!("Lock service worker panicked");
        }
        tracing::info!("Lock service stopped");
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
