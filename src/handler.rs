//! The request handler seam and a small routing table.

use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Business logic invoked once per accepted request.
///
/// Implementations never fail: internal errors are reported as a response
/// carrying an appropriate status and a JSON `{"message": ...}` body.
///
/// The dispatcher applies no deadline. A call that hangs occupies one worker
/// slot until the process restarts, so long-running handlers should enforce
/// their own timeout (e.g. `tokio::time::timeout`) at this boundary.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope;
}

type RouteFn = Arc<dyn Fn(&RequestEnvelope) -> ResponseEnvelope + Send + Sync>;

/// Exact `(METHOD, path)` routing. Query strings are ignored for matching.
#[derive(Default, Clone)]
pub struct Router {
    routes: HashMap<(String, String), RouteFn>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `route` for `method` on `path`. A later registration replaces
    /// an earlier one.
    pub fn route<F>(mut self, method: &str, path: &str, route: F) -> Self
    where
        F: Fn(&RequestEnvelope) -> ResponseEnvelope + Send + Sync + 'static,
    {
        self.routes.insert(
            (method.to_ascii_uppercase(), normalize_path(path)),
            Arc::new(route),
        );
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl RequestHandler for Router {
    async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let key = (
            request.method.to_ascii_uppercase(),
            normalize_path(&request.path),
        );
        match self.routes.get(&key) {
            Some(route) => route(&request),
            None => ResponseEnvelope::error(
                request.request_id.clone(),
                404,
                format!("No handler for {} {}", key.0, key.1),
            ),
        }
    }
}

fn normalize_path(path: &str) -> String {
    let without_query = path.split(['?', '#']).next().unwrap_or_default();
    let trimmed = without_query.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
