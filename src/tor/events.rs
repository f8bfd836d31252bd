//! Asynchronous event routing and hidden-service readiness
//!
//! The control connection's reader task pushes every `650` event payload
//! through [`EventRouter::dispatch`]. Circuit/warning/error events are only
//! logged; a descriptor-upload confirmation flips the matching service to
//! ready and fires its one-shot listeners.
//!
//! Dispatch runs on the reader task, so listeners must be short and
//! non-blocking; anything long-running should hand off to its own task.

use crate::socket::HiddenServiceSocket;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

const EVENT_HS_DESC: &str = "HS_DESC";
const UPLOADED: &str = "UPLOADED";

/// Routes control-protocol events to logging and the readiness registry.
pub struct EventRouter {
    registry: ReadyRegistry<HiddenServiceSocket>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            registry: ReadyRegistry::new(),
        }
    }

    pub(crate) fn registry(&self) -> &ReadyRegistry<HiddenServiceSocket> {
        &self.registry
    }

    /// Handle one event payload (the line after the `650 ` code).
    pub fn dispatch(&self, payload: &str) {
        let (category, rest) = match payload.split_once(' ') {
            Some((category, rest)) => (category, rest),
            None => (payload, ""),
        };

        match category {
            "CIRC" => debug!("circuit status: {}", rest),
            "WARN" => warn!("tor: {}", rest),
            "ERR" => error!("tor: {}", rest),
            EVENT_HS_DESC => {
                if let Some(service) = descriptor_uploaded(rest) {
                    info!("hidden service {} is ready", service);
                    self.registry.mark_ready(&service);
                }
            },
            _ => debug!("unrecognized event: {}", payload),
        }
    }
}

/// Recognize a descriptor-upload confirmation and return the service name
/// it belongs to. The payload looks like `UPLOADED <serviceid> UNKNOWN
/// <hsdir-fingerprint>`; the registry is keyed by `<serviceid>.onion`.
fn descriptor_uploaded(payload: &str) -> Option<String> {
    if !payload.starts_with(UPLOADED) {
        return None;
    }
    let service_id = payload.split(' ').nth(1)?;
    Some(format!("{}.onion", service_id))
}

/// One-shot readiness callback, invoked with the owning socket handle.
pub type ReadyListener<S> = Box<dyn FnOnce(S) + Send>;

enum Phase {
    AwaitingUpload,
    Ready,
}

struct Record<S> {
    phase: Phase,
    handle: Option<S>,
    listeners: Vec<ReadyListener<S>>,
}

/// Per-service readiness state, keyed by service name.
///
/// A single lock serializes every registration, readiness transition and
/// removal: a listener added concurrently with the upload event is either
/// drained by the transition or sees the ready phase and fires on the
/// spot, so it runs exactly once. The record stays in the map after the
/// transition (phase `Ready`) until the service is unpublished, so late
/// registrations are not silently dropped.
///
/// Generic over the handle type so the state machine can be exercised
/// without a live daemon.
pub(crate) struct ReadyRegistry<S> {
    records: Mutex<HashMap<String, Record<S>>>,
}

impl<S: Clone> ReadyRegistry<S> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Create the record for a freshly-published service.
    pub fn register(&self, service_name: &str) {
        let mut records = self.records.lock().expect("registry lock");
        records.insert(
            service_name.to_string(),
            Record {
                phase: Phase::AwaitingUpload,
                handle: None,
                listeners: Vec::new(),
            },
        );
    }

    /// Attach the socket handle listeners will be invoked with. If the
    /// upload confirmation already arrived, pending listeners fire now.
    pub fn attach(&self, service_name: &str, handle: S) {
        let fired = {
            let mut records = self.records.lock().expect("registry lock");
            match records.get_mut(service_name) {
                Some(record) => {
                    record.handle = Some(handle.clone());
                    match record.phase {
                        Phase::Ready => Some(std::mem::take(&mut record.listeners)),
                        Phase::AwaitingUpload => None,
                    }
                },
                None => None,
            }
        };
        if let Some(listeners) = fired {
            for listener in listeners {
                listener(handle.clone());
            }
        }
    }

    /// Add a one-shot readiness listener. Fires immediately (on the
    /// caller's thread) when the service is already ready; does nothing
    /// for an unknown or unpublished service.
    pub fn add_listener(&self, service_name: &str, listener: ReadyListener<S>) {
        let fire_now = {
            let mut records = self.records.lock().expect("registry lock");
            match records.get_mut(service_name) {
                Some(record) => match (&record.phase, record.handle.clone()) {
                    (Phase::Ready, Some(handle)) => Some((listener, handle)),
                    // Upload pending or no handle attached yet; parked
                    // until the ready transition or attach drains it.
                    _ => {
                        record.listeners.push(listener);
                        None
                    },
                },
                None => {
                    debug!("ready listener for unknown service {}", service_name);
                    None
                },
            }
        };
        if let Some((listener, handle)) = fire_now {
            listener(handle);
        }
    }

    /// Flip the service to ready and fire its pending listeners, in
    /// registration order. Listeners are drained under the lock and
    /// invoked after it is released, so they may re-enter the registry.
    pub fn mark_ready(&self, service_name: &str) {
        let fired = {
            let mut records = self.records.lock().expect("registry lock");
            match records.get_mut(service_name) {
                Some(record) => {
                    record.phase = Phase::Ready;
                    match record.handle.clone() {
                        Some(handle) => {
                            let listeners = std::mem::take(&mut record.listeners);
                            Some((listeners, handle))
                        },
                        None => None,
                    }
                },
                None => None,
            }
        };
        if let Some((listeners, handle)) = fired {
            for listener in listeners {
                listener(handle.clone());
            }
        }
    }

    /// Drop the record and any listeners that never fired.
    pub fn remove(&self, service_name: &str) {
        let mut records = self.records.lock().expect("registry lock");
        records.remove(service_name);
    }
}
