//! Ops backing the guest environment: console, timers, resource loading,
//! location, the render API and the crypto/encoding globals.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{anyhow, Error};
use deno_core::{op2, OpState};
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::api::{RenderApi, TraceSession};
use crate::loader::ResourceLoader;
use crate::logging::VirtualConsole;
use crate::timers::TimerGate;

/// Per-context host state reachable from ops
pub struct SandboxState {
    pub url: Url,
    pub console: VirtualConsole,
    pub api: RenderApi,
    pub loader: std::sync::Arc<dyn ResourceLoader>,
    traces: HashMap<u32, TraceSession>,
    next_trace: u32,
}

impl SandboxState {
    pub fn new(
        url: Url,
        console: VirtualConsole,
        api: RenderApi,
        loader: std::sync::Arc<dyn ResourceLoader>,
    ) -> Self {
        Self {
            url,
            console,
            api,
            loader,
            traces: HashMap::new(),
            next_trace: 1,
        }
    }
}

/// How the guest render promise settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettledAs {
    Fulfilled,
    Rejected,
    /// Fulfilled with a value that could not be copied out of the sandbox.
    Unserializable,
}

#[derive(Debug)]
pub struct RenderOutcome {
    pub settled: SettledAs,
    pub value: Value,
}

// ============================================================================
// Console Ops
// ============================================================================

#[op2(fast)]
fn op_sandbox_console(state: &mut OpState, #[string] method: &str, #[string] msg: &str) {
    if let Some(sandbox) = state.try_borrow::<SandboxState>() {
        sandbox.console.console(method, msg);
    }
}

#[op2(fast)]
fn op_sandbox_dom_error(state: &mut OpState, #[string] kind: &str, #[string] msg: &str) {
    if let Some(sandbox) = state.try_borrow::<SandboxState>() {
        sandbox.console.dom_error(kind, msg);
    }
}

// ============================================================================
// Timer Ops
// ============================================================================

#[op2(async)]
async fn op_timer_sleep(delay: u32) {
    tokio::time::sleep(std::time::Duration::from_millis(delay as u64)).await;
}

#[op2(fast)]
fn op_timer_gate_admit(state: &mut OpState) -> bool {
    state
        .try_borrow::<TimerGate>()
        .map(TimerGate::admit)
        .unwrap_or(true)
}

// ============================================================================
// Document Ops
// ============================================================================

#[derive(Debug, Serialize)]
struct LocationParts {
    href: String,
    origin: String,
    protocol: String,
    host: String,
    hostname: String,
    port: String,
    pathname: String,
    search: String,
    hash: String,
}

impl From<&Url> for LocationParts {
    fn from(url: &Url) -> Self {
        let hostname = url.host_str().unwrap_or_default().to_string();
        let port = url.port().map(|p| p.to_string()).unwrap_or_default();
        let host = if port.is_empty() {
            hostname.clone()
        } else {
            format!("{}:{}", hostname, port)
        };
        Self {
            href: url.to_string(),
            origin: url.origin().ascii_serialization(),
            protocol: format!("{}:", url.scheme()),
            host,
            hostname,
            port,
            pathname: url.path().to_string(),
            search: url.query().map(|q| format!("?{}", q)).unwrap_or_default(),
            hash: url.fragment().map(|f| format!("#{}", f)).unwrap_or_default(),
        }
    }
}

#[op2]
#[serde]
fn op_sandbox_location(state: &mut OpState) -> Result<LocationParts, Error> {
    let sandbox = state
        .try_borrow::<SandboxState>()
        .ok_or_else(|| anyhow!("Sandbox state missing"))?;
    Ok(LocationParts::from(&sandbox.url))
}

/// Resolve a guest-supplied reference against the document URL.
#[op2]
#[string]
fn op_sandbox_resolve_url(state: &mut OpState, #[string] reference: &str) -> String {
    state
        .try_borrow::<SandboxState>()
        .and_then(|sandbox| sandbox.url.join(reference).ok())
        .map(|url| url.to_string())
        .unwrap_or_else(|| reference.to_string())
}

/// Fetch a sub-resource through the render's resource loader.
///
/// A loader with no answer yields an empty body, which the guest document
/// reports as a load failure.
#[op2(async)]
#[serde]
async fn op_resource_fetch(
    state: Rc<RefCell<OpState>>,
    #[string] url: String,
) -> Result<String, Error> {
    let loader = {
        let state_ref = state.borrow();
        match state_ref.try_borrow::<SandboxState>() {
            Some(sandbox) => std::sync::Arc::clone(&sandbox.loader),
            None => return Ok(String::new()),
        }
    };

    let Some(fetch) = loader.fetch(&url) else {
        return Ok(String::new());
    };

    let bytes = fetch
        .await
        .map_err(|e| anyhow!("Failed to load '{}': {}", url, e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// ============================================================================
// Render API Ops
// ============================================================================

#[op2]
#[serde]
fn op_render_api_get_header(state: &mut OpState, #[string] name: String) -> Option<String> {
    state
        .try_borrow::<SandboxState>()
        .and_then(|sandbox| sandbox.api.get_header(&name).map(String::from))
}

#[op2(fast)]
fn op_render_api_trace_begin(state: &mut OpState, #[string] name: &str) -> u32 {
    let Some(sandbox) = state.try_borrow_mut::<SandboxState>() else {
        return 0;
    };
    let id = sandbox.next_trace;
    sandbox.next_trace += 1;
    let session = sandbox.api.trace(name);
    sandbox.traces.insert(id, session);
    id
}

#[op2(fast)]
fn op_render_api_trace_label(
    state: &mut OpState,
    id: u32,
    #[string] key: &str,
    #[string] value: &str,
) {
    if let Some(session) = state
        .try_borrow_mut::<SandboxState>()
        .and_then(|sandbox| sandbox.traces.get_mut(&id))
    {
        session.add_label(key, value);
    }
}

#[op2(fast)]
fn op_render_api_trace_end(state: &mut OpState, id: u32) {
    if let Some(session) = state
        .try_borrow_mut::<SandboxState>()
        .and_then(|sandbox| sandbox.traces.remove(&id))
    {
        session.end();
    }
}

/// Record how the guest render promise settled.
#[op2]
fn op_render_settled(state: &mut OpState, #[string] settled: &str, #[serde] value: Value) {
    let settled = match settled {
        "fulfilled" => SettledAs::Fulfilled,
        "unserializable" => SettledAs::Unserializable,
        _ => SettledAs::Rejected,
    };
    state.put(RenderOutcome { settled, value });
}

// ============================================================================
// Crypto / Encoding Ops
// ============================================================================

#[op2]
#[string]
fn op_crypto_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2(fast)]
fn op_crypto_get_random_values(#[buffer] buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

#[op2]
#[string]
fn op_btoa(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    Ok(base64::engine::general_purpose::STANDARD.encode(data.as_bytes()))
}

#[op2]
#[string]
fn op_atob(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("Invalid UTF-8 in decoded data: {}", e))
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    render_sandbox,
    ops = [
        op_sandbox_console,
        op_sandbox_dom_error,
        op_timer_sleep,
        op_timer_gate_admit,
        op_sandbox_location,
        op_sandbox_resolve_url,
        op_resource_fetch,
        op_render_api_get_header,
        op_render_api_trace_begin,
        op_render_api_trace_label,
        op_render_api_trace_end,
        op_render_settled,
        op_crypto_random_uuid,
        op_crypto_get_random_values,
        op_btoa,
        op_atob,
    ],
);
