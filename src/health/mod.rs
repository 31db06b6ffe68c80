//! Process-wide component health registry.
//!
//! Components (bus connections, the daemon, supervisors) report their status
//! here; the daemon's state writer and the status route render it.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub updated_at: String,
    pub last_ok: Option<String>,
    pub last_error: Option<String>,
    pub restart_count: u64,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl Default for ComponentHealth {
    fn default() -> Self {
        Self {
            status: "starting".into(),
            updated_at: now_rfc3339(),
            last_ok: None,
            last_error: None,
            restart_count: 0,
            detail: Value::Null,
        }
    }
}

struct Registry {
    started_at: Instant,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        started_at: Instant::now(),
        components: Mutex::new(BTreeMap::new()),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn upsert(component: &str, update: impl FnOnce(&mut ComponentHealth)) {
    let mut map = registry().components.lock();
    let entry = map.entry(component.to_string()).or_default();
    update(&mut *entry);
    entry.updated_at = now_rfc3339();
}

pub fn mark_component_ok(component: &str) {
    upsert(component, |entry| {
        entry.status = "ok".into();
        entry.last_ok = Some(now_rfc3339());
    });
}

pub fn mark_component_error(component: &str, error: impl ToString) {
    let error = error.to_string();
    upsert(component, move |entry| {
        entry.status = "error".into();
        entry.last_error = Some(error);
    });
}

/// Record a non-error status such as a connection state name.
pub fn mark_component_status(component: &str, status: &str) {
    upsert(component, |entry| {
        entry.status = status.to_string();
    });
}

pub fn bump_component_restart(component: &str) {
    upsert(component, |entry| {
        entry.restart_count = entry.restart_count.saturating_add(1);
    });
}

/// Attach structured detail (pool stats, connection state) to a component.
pub fn set_component_detail(component: &str, detail: Value) {
    upsert(component, |entry| {
        entry.detail = detail;
    });
}

pub fn component(component: &str) -> Option<ComponentHealth> {
    registry().components.lock().get(component).cloned()
}

pub fn snapshot_json() -> Value {
    let registry = registry();
    let components = registry.components.lock().clone();
    serde_json::json!({
        "pid": std::process::id(),
        "uptime_seconds": registry.started_at.elapsed().as_secs(),
        "components": components,
    })
}
