//! Shared test doubles for Conductor crates.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use conductor_core::event::{EventBus, EventListener};
use conductor_core::traits::Integration;
use conductor_core::types::{EventKind, LifecycleEvent};

/// Listener that keeps every event it sees.
///
/// The bus holds listeners weakly, so keep the returned `Arc` alive for as
/// long as events should be recorded.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a recorder and register it on `bus`.
    pub fn attach(bus: &EventBus) -> Arc<Self> {
        let recorder = Self::new();
        bus.add_listener(&recorder);
        recorder
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn last(&self) -> Option<LifecycleEvent> {
        self.events.lock().unwrap().last().cloned()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventListener for EventRecorder {
    fn on_event(&self, event: &LifecycleEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Shared invocation counter for work functions and handlers.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicU32>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new count (1 on the first call).
    pub fn hit(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Recording stand-in for an external collaborator.
pub struct MockIntegration {
    name: String,
    fail_initialize: bool,
    calls: Mutex<Vec<String>>,
}

impl MockIntegration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_initialize: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make `initialize` fail.
    pub fn failing(name: impl Into<String>) -> Self {
        Self {
            fail_initialize: true,
            ..Self::new(name)
        }
    }

    /// Record a domain operation and echo back a provider-shaped record.
    pub fn record(&self, operation: &str, payload: serde_json::Value) -> serde_json::Value {
        self.calls.lock().unwrap().push(operation.to_string());
        serde_json::json!({
            "id": format!("{}-{}", self.name, self.calls.lock().unwrap().len()),
            "operation": operation,
            "payload": payload,
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Integration for MockIntegration {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push("initialize".into());
            if self.fail_initialize {
                anyhow::bail!("{} refused the connection", self.name);
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push("close".into());
            Ok(())
        })
    }
}

/// Lead payloads used across pipeline tests.
pub mod fixtures {
    use serde_json::{json, Value};

    /// Scores 20 + 15 + 30 = 65 in the lead pipeline.
    pub fn qualified_lead() -> Value {
        json!({
            "email": "a@b.com",
            "company": "AcmeCorporation",
            "title": "CTO",
            "phone": "555",
        })
    }

    pub fn lead_without_company() -> Value {
        json!({
            "email": "a@b.com",
            "title": "CTO",
            "phone": "555",
        })
    }

    /// Short company, no phone, no senior title: scores 0.
    pub fn cold_lead() -> Value {
        json!({
            "email": "x@y.io",
            "company": "Acme",
            "title": "Intern",
        })
    }
}
