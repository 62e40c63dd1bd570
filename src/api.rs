//! The capability object handed to configuration hooks and to guest render code.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use crate::logging::Logger;

/// Per-request view of the inbound request plus a tracing entry point.
#[derive(Clone)]
pub struct RenderApi {
    headers: Arc<HashMap<String, String>>,
    logger: Arc<dyn Logger>,
}

impl RenderApi {
    /// Header names are matched case-insensitively.
    pub fn new<I, K, V>(headers: I, logger: Arc<dyn Logger>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.as_ref().to_ascii_lowercase(), value.into()))
            .collect();
        Self {
            headers: Arc::new(headers),
            logger,
        }
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Open a named trace session covering one logical phase.
    pub fn trace(&self, name: &str) -> TraceSession {
        TraceSession::start(name, Arc::clone(&self.logger))
    }
}

/// One traced phase. Ends exactly once: explicitly via [`TraceSession::end`],
/// or on drop when an error unwinds the phase early.
pub struct TraceSession {
    name: String,
    span: tracing::Span,
    started: Instant,
    labels: Vec<(String, String)>,
    logger: Arc<dyn Logger>,
    ended: bool,
}

impl TraceSession {
    fn start(name: &str, logger: Arc<dyn Logger>) -> Self {
        let span = tracing::debug_span!("trace", name = %name);
        Self {
            name: name.to_string(),
            span,
            started: Instant::now(),
            labels: Vec::new(),
            logger,
            ended: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.push((key.into(), value.into()));
    }

    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        let _entered = self.span.enter();
        let labels: serde_json::Map<String, serde_json::Value> = self
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();
        self.logger.debug(
            &format!("Trace {} ended", self.name),
            Some(&json!({
                "elapsed_ms": self.started.elapsed().as_millis() as u64,
                "labels": labels,
            })),
        );
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        self.finish();
    }
}
