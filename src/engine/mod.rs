//! The seam between render orchestration and the script engine.
//!
//! [`crate::environment::SandboxEnvironment`] is written once against these
//! traits; [`DenoEngine`] is the V8-backed implementation.

mod deno;
mod ops;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use url::Url;

use crate::api::RenderApi;
use crate::error::RenderError;
use crate::loader::ResourceLoader;
use crate::logging::Logger;
use crate::teardown::Closeable;
use crate::timers::TimerGate;

pub use deno::{DenoContext, DenoEngine};

/// Everything a fresh sandbox context is wired to.
pub struct ContextSetup {
    /// The page being rendered; the guest document behaves as if navigated here.
    pub url: Url,
    /// Backend for sub-resources requested by the guest document.
    pub loader: Arc<dyn ResourceLoader>,
    /// Host logger behind the guest console.
    pub logger: Arc<dyn Logger>,
    pub api: RenderApi,
    /// V8 heap cap in bytes
    pub max_heap_size: Option<usize>,
    /// Terminate the isolate after this long
    pub render_timeout: Option<Duration>,
}

pub trait SandboxEngine {
    type Context: SandboxContext;

    fn create_context(&self, setup: ContextSetup) -> Result<Self::Context, RenderError>;
}

/// Global-scope access, as offered to after-setup hooks.
pub trait ContextGlobals {
    /// Define `globalThis[name]` as a copy of `value`.
    fn set_global(&mut self, name: &str, value: Value) -> Result<(), RenderError>;

    /// Execute a classic script; `filename` shows up in stack traces.
    fn run_script(&mut self, source: &str, filename: &str) -> Result<(), RenderError>;

    /// Evaluate an expression and copy its value out of the sandbox.
    fn evaluate(&mut self, expression: &str) -> Result<Value, RenderError>;
}

/// A live per-request sandbox.
#[allow(async_fn_in_trait)]
pub trait SandboxContext: ContextGlobals {
    /// Closes the context itself; registered first so it is closed last.
    fn closer(&mut self) -> Box<dyn Closeable>;

    /// Route the guest's timer callbacks through `gate`.
    fn patch_timers(&mut self, gate: TimerGate) -> Result<(), RenderError>;

    /// Define the global registration function that captures the render callback.
    fn install_registration(&mut self, callback_name: &str) -> Result<(), RenderError>;

    fn has_render_callback(&mut self) -> Result<bool, RenderError>;

    /// Call the captured render callback inside the sandbox and wait for its result.
    async fn invoke_render(&mut self) -> Result<Value, RenderError>;

    /// Let pending guest work (timers, sub-resource loads) run for up to `budget`.
    async fn settle(&mut self, budget: Duration);
}
