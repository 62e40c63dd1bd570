//! V8-backed sandbox contexts built on deno_core.
//!
//! Each render gets a fresh `JsRuntime`. The guest environment (console,
//! timers, a minimal document, location) is installed by `bootstrap.js`
//! before anything else runs; all host capabilities go through the ops in
//! [`super::ops`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use anyhow::anyhow;
use deno_core::error::JsError;
use deno_core::{serde_v8, v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;

use super::ops::{render_sandbox, RenderOutcome, SandboxState, SettledAs};
use super::{ContextGlobals, ContextSetup, SandboxContext, SandboxEngine};
use crate::error::{ErrorInfo, RenderError};
use crate::loader::ResourceLoader;
use crate::logging::{Logger, VirtualConsole};
use crate::teardown::Closeable;
use crate::timers::TimerGate;

const BOOTSTRAP: &str = include_str!("bootstrap.js");

/// Number of timer entry points the guard wraps
const GUARDED_TIMERS: f64 = 3.0;

/// Creates one [`DenoContext`] per render.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenoEngine;

impl SandboxEngine for DenoEngine {
    type Context = DenoContext;

    fn create_context(&self, setup: ContextSetup) -> Result<DenoContext, RenderError> {
        DenoContext::new(setup)
    }
}

/// Terminates the isolate if the render overruns its budget.
///
/// Runs on its own thread so CPU-bound guest loops are interrupted too.
struct Watchdog {
    cancel: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Watchdog {
    fn spawn(handle: v8::IsolateHandle, limit: Duration, fired: Arc<AtomicBool>) -> Self {
        let (cancel, cancel_rx) = std::sync::mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(limit)
            {
                fired.store(true, Ordering::SeqCst);
                handle.terminate_execution();
            }
        });
        Self {
            cancel: Some(cancel),
            thread: Some(thread),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Dropping the sender wakes the thread before its deadline.
        self.cancel.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A live sandbox context backed by a dedicated `JsRuntime`.
pub struct DenoContext {
    // Declared before `runtime` so the watchdog thread is joined while the
    // isolate it may terminate is still alive.
    _watchdog: Option<Watchdog>,
    runtime: JsRuntime,
    loader: Arc<dyn ResourceLoader>,
    logger: Arc<dyn Logger>,
    render_timeout: Option<Duration>,
    timed_out: Arc<AtomicBool>,
    heap_exhausted: Arc<AtomicBool>,
}

impl DenoContext {
    pub fn new(setup: ContextSetup) -> Result<Self, RenderError> {
        let create_params = setup
            .max_heap_size
            .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![render_sandbox::init_ops_and_esm()],
            create_params,
            ..Default::default()
        });

        let heap_exhausted = Arc::new(AtomicBool::new(false));
        if setup.max_heap_size.is_some() {
            let handle = runtime.v8_isolate().thread_safe_handle();
            let exhausted = Arc::clone(&heap_exhausted);
            runtime.add_near_heap_limit_callback(move |current, _initial| {
                exhausted.store(true, Ordering::SeqCst);
                handle.terminate_execution();
                // Headroom for V8 to unwind the terminated script.
                current + 8 * 1024 * 1024
            });
        }

        runtime.op_state().borrow_mut().put(SandboxState::new(
            setup.url,
            VirtualConsole::new(Arc::clone(&setup.logger)),
            setup.api,
            Arc::clone(&setup.loader),
        ));

        runtime
            .execute_script("[render-sandbox:bootstrap]", BOOTSTRAP.to_string())
            .map_err(|e| RenderError::Engine(e.context("Failed to bootstrap sandbox")))?;

        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = setup.render_timeout.map(|limit| {
            Watchdog::spawn(
                runtime.v8_isolate().thread_safe_handle(),
                limit,
                Arc::clone(&timed_out),
            )
        });

        Ok(Self {
            _watchdog: watchdog,
            runtime,
            loader: setup.loader,
            logger: setup.logger,
            render_timeout: setup.render_timeout,
            timed_out,
            heap_exhausted,
        })
    }

    /// Map an engine error to the render failure it represents.
    fn classify(&self, err: anyhow::Error) -> RenderError {
        if self.timed_out.load(Ordering::SeqCst) {
            let ms = self.render_timeout.map(|d| d.as_millis() as u64).unwrap_or_default();
            return RenderError::Timeout(ms);
        }
        if self.heap_exhausted.load(Ordering::SeqCst) {
            return RenderError::Engine(anyhow!("Render exceeded the sandbox heap limit"));
        }
        match err.downcast::<JsError>() {
            Ok(js) => RenderError::UserRenderException {
                message: js.exception_message.clone(),
                stack: js.stack.clone(),
            },
            Err(other) => RenderError::Engine(other),
        }
    }

    fn eval(&mut self, code: String) -> Result<Value, RenderError> {
        let global = self
            .runtime
            .execute_script("[render-sandbox:internal]", code)
            .map_err(|e| self.classify(e))?;

        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &global);
        serde_v8::from_v8::<Value>(scope, local)
            .map_err(|e| RenderError::Engine(anyhow!("Failed to read sandbox value: {}", e)))
    }

    fn take_outcome(runtime: &mut JsRuntime) -> Option<RenderOutcome> {
        runtime.op_state().borrow_mut().try_take::<RenderOutcome>()
    }

    /// Drive the event loop until the guest render promise settles.
    ///
    /// Stops as soon as the outcome is recorded; intervals still pending at
    /// that point do not hold the render open.
    async fn await_outcome(&mut self) -> Result<RenderOutcome, RenderError> {
        let runtime = &mut self.runtime;
        let result = std::future::poll_fn(|cx| {
            if let Some(outcome) = Self::take_outcome(runtime) {
                return Poll::Ready(Ok(outcome));
            }
            match runtime.poll_event_loop(cx, PollEventLoopOptions::default()) {
                Poll::Ready(Ok(())) => Poll::Ready(
                    Self::take_outcome(runtime)
                        .ok_or_else(|| anyhow!("Render function returned a promise that never settled")),
                ),
                Poll::Ready(Err(err)) => {
                    Poll::Ready(Self::take_outcome(runtime).map(Ok).unwrap_or(Err(err)))
                }
                Poll::Pending => match Self::take_outcome(runtime) {
                    Some(outcome) => Poll::Ready(Ok(outcome)),
                    None => Poll::Pending,
                },
            }
        })
        .await;
        result.map_err(|e| self.classify(e))
    }
}

impl ContextGlobals for DenoContext {
    fn set_global(&mut self, name: &str, value: Value) -> Result<(), RenderError> {
        let name = serde_json::to_string(name).map_err(anyhow::Error::from)?;
        let value = serde_json::to_string(&value).map_err(anyhow::Error::from)?;
        self.eval(format!("globalThis[{}] = {}; undefined", name, value))?;
        Ok(())
    }

    fn run_script(&mut self, source: &str, filename: &str) -> Result<(), RenderError> {
        let filename: String = filename.chars().filter(|c| !c.is_control()).collect();
        let code = format!("{}\n//# sourceURL={}", source, filename);
        self.runtime
            .execute_script("[render-sandbox:script]", code)
            .map_err(|e| self.classify(e))?;
        Ok(())
    }

    fn evaluate(&mut self, expression: &str) -> Result<Value, RenderError> {
        self.eval(format!("({})", expression))
    }
}

impl SandboxContext for DenoContext {
    fn closer(&mut self) -> Box<dyn Closeable> {
        Box::new(ContextCloser {
            loader: Arc::clone(&self.loader),
            isolate: self.runtime.v8_isolate().thread_safe_handle(),
        })
    }

    fn patch_timers(&mut self, gate: TimerGate) -> Result<(), RenderError> {
        self.runtime.op_state().borrow_mut().put(gate);
        let patched = self.eval(
            "(() => { const guard = globalThis.__renderSandbox.takeTimerGuard(); \
             return typeof guard === 'function' ? guard(globalThis) : -1; })()"
                .to_string(),
        )?;
        match patched.as_f64() {
            Some(count) if count == GUARDED_TIMERS => Ok(()),
            _ => Err(RenderError::Engine(anyhow!(
                "Timer guard could not be installed (result: {})",
                patched
            ))),
        }
    }

    fn install_registration(&mut self, callback_name: &str) -> Result<(), RenderError> {
        let name = serde_json::to_string(callback_name).map_err(anyhow::Error::from)?;
        self.eval(format!(
            "globalThis.__renderSandbox.installRegistration({}); undefined",
            name
        ))?;
        Ok(())
    }

    fn has_render_callback(&mut self) -> Result<bool, RenderError> {
        let registered = self.eval("globalThis.__renderSandbox.hasRenderCallback()".to_string())?;
        Ok(registered.as_bool().unwrap_or(false))
    }

    async fn invoke_render(&mut self) -> Result<Value, RenderError> {
        // Clear anything a previous invocation left behind.
        Self::take_outcome(&mut self.runtime);
        self.eval("globalThis.__renderSandbox.invokeRender(); undefined".to_string())?;

        let outcome = match self.render_timeout {
            // Covers renders parked on guest timers, which the watchdog cannot interrupt.
            Some(limit) => tokio::time::timeout(limit, self.await_outcome())
                .await
                .map_err(|_| RenderError::Timeout(limit.as_millis() as u64))??,
            None => self.await_outcome().await?,
        };
        match outcome.settled {
            SettledAs::Fulfilled => Ok(outcome.value),
            SettledAs::Rejected => {
                let info = ErrorInfo::from_value(&outcome.value);
                Err(RenderError::UserRenderException {
                    message: info.error,
                    stack: info.stack,
                })
            }
            SettledAs::Unserializable => Err(RenderError::MalformedResult(format!(
                "render result could not be serialized: {}",
                outcome.value.as_str().unwrap_or("unknown reason")
            ))),
        }
    }

    async fn settle(&mut self, budget: Duration) {
        let runtime = &mut self.runtime;
        let drained = tokio::time::timeout(
            budget,
            std::future::poll_fn(|cx| runtime.poll_event_loop(cx, PollEventLoopOptions::default())),
        )
        .await;
        if let Ok(Err(err)) = drained {
            self.logger
                .debug(&format!("Sandbox event loop stopped while settling: {:#}", err), None);
        }
    }
}

/// Closes the context's resource loader and stops any further script execution.
struct ContextCloser {
    loader: Arc<dyn ResourceLoader>,
    isolate: v8::IsolateHandle,
}

impl Closeable for ContextCloser {
    fn close(&mut self) -> anyhow::Result<()> {
        self.loader.close();
        self.isolate.terminate_execution();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RenderApi;
    use crate::logging::{LogLevel, MemoryLogger};
    use crate::testing::MemoryLoader;
    use url::Url;

    fn context(logger: &MemoryLogger, loader: MemoryLoader) -> DenoContext {
        let logger: Arc<dyn Logger> = Arc::new(logger.clone());
        DenoEngine
            .create_context(ContextSetup {
                url: Url::parse("https://example.com/math?lang=fr").unwrap(),
                loader: Arc::new(loader),
                logger: Arc::clone(&logger),
                api: RenderApi::new([("Accept-Language", "fr")], logger),
                max_heap_size: None,
                render_timeout: None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_console_levels_reach_logger() {
        let logger = MemoryLogger::new();
        let mut ctx = context(&logger, MemoryLoader::new());
        ctx.run_script("console.warn('careful', { n: 1 }); console.trace('deep');", "app.js")
            .unwrap();

        assert_eq!(logger.matching(LogLevel::Warn, "careful {\"n\":1}").len(), 1);
        assert_eq!(logger.matching(LogLevel::Silly, "deep").len(), 1);
    }

    #[tokio::test]
    async fn test_location_reflects_render_url() {
        let logger = MemoryLogger::new();
        let mut ctx = context(&logger, MemoryLoader::new());
        assert_eq!(ctx.evaluate("location.pathname").unwrap(), "/math");
        assert_eq!(ctx.evaluate("window.location.search").unwrap(), "?lang=fr");
        assert_eq!(ctx.evaluate("typeof Deno").unwrap(), "undefined");
    }

    #[tokio::test]
    async fn test_script_error_carries_filename() {
        let logger = MemoryLogger::new();
        let mut ctx = context(&logger, MemoryLoader::new());
        let err = ctx
            .run_script("function boom() { throw new Error('kaput'); }\nboom();", "bundle.js")
            .unwrap_err();
        match err {
            RenderError::UserRenderException { message, stack } => {
                assert!(message.contains("kaput"));
                assert!(stack.unwrap_or_default().contains("bundle.js"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_set_global_and_evaluate() {
        let logger = MemoryLogger::new();
        let mut ctx = context(&logger, MemoryLoader::new());
        ctx.set_global("process", serde_json::json!({ "env": { "NODE_ENV": "test" } }))
            .unwrap();
        assert_eq!(ctx.evaluate("process.env.NODE_ENV").unwrap(), "test");
    }

    #[tokio::test]
    async fn test_timer_guard_installs_once() {
        let logger = MemoryLogger::new();
        let mut ctx = context(&logger, MemoryLoader::new());
        let gate = TimerGate::new(Arc::new(logger.clone()));
        ctx.patch_timers(gate.clone()).unwrap();
        assert!(ctx.patch_timers(gate).is_err());
    }

    #[tokio::test]
    async fn test_dynamic_script_loads_through_loader() {
        let logger = MemoryLogger::new();
        let loader = MemoryLoader::new().with_file("https://example.com/late.js", "window.LATE = 42;");
        let mut ctx = context(&logger, loader);
        ctx.run_script(
            "const s = document.createElement('script'); s.src = '/late.js'; \
             s.onload = () => { window.LOADED = true; }; document.head.appendChild(s);",
            "app.js",
        )
        .unwrap();
        ctx.settle(Duration::from_millis(200)).await;

        assert_eq!(ctx.evaluate("window.LATE").unwrap().as_f64(), Some(42.0));
        assert_eq!(ctx.evaluate("window.LOADED").unwrap(), true);
    }

    #[tokio::test]
    async fn test_image_load_failures_stay_quiet() {
        let logger = MemoryLogger::new();
        let mut ctx = context(&logger, MemoryLoader::new());
        ctx.run_script(
            "const img = document.createElement('img'); img.src = '/logo.png'; \
             document.body.appendChild(img); \
             const s = document.createElement('script'); s.src = '/missing.js'; \
             document.body.appendChild(s);",
            "app.js",
        )
        .unwrap();
        ctx.settle(Duration::from_millis(200)).await;

        assert!(logger.matching(LogLevel::Error, "Could not load img").is_empty());
        assert_eq!(logger.matching(LogLevel::Error, "Could not load script").len(), 1);
    }

    #[tokio::test]
    async fn test_render_api_is_reachable_from_guest() {
        let logger = MemoryLogger::new();
        let mut ctx = context(&logger, MemoryLoader::new());
        ctx.install_registration("__register").unwrap();
        ctx.run_script(
            "__register((api) => { const t = api.trace('guest'); t.addLabel('k', 'v'); t.end(); \
             return { body: api.getHeader('ACCEPT-LANGUAGE'), status: 200, headers: {} }; });",
            "app.js",
        )
        .unwrap();
        assert!(ctx.has_render_callback().unwrap());

        let value = ctx.invoke_render().await.unwrap();
        assert_eq!(value["body"], "fr");
        assert_eq!(logger.matching(LogLevel::Debug, "Trace guest ended").len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_simplified() {
        let logger = MemoryLogger::new();
        let mut ctx = context(&logger, MemoryLoader::new());
        ctx.install_registration("__register").unwrap();
        ctx.run_script(
            "__register(async () => { const e = { error: { message: 'nested' } }; e.error.error = e; throw e; });",
            "app.js",
        )
        .unwrap();

        match ctx.invoke_render().await.unwrap_err() {
            RenderError::UserRenderException { message, .. } => assert_eq!(message, "nested"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_watchdog_interrupts_busy_loop() {
        let logger = MemoryLogger::new();
        let logger_arc: Arc<dyn Logger> = Arc::new(logger.clone());
        let mut ctx = DenoEngine
            .create_context(ContextSetup {
                url: Url::parse("https://example.com/").unwrap(),
                loader: Arc::new(MemoryLoader::new()),
                logger: Arc::clone(&logger_arc),
                api: RenderApi::new(Vec::<(String, String)>::new(), logger_arc),
                max_heap_size: None,
                render_timeout: Some(Duration::from_millis(100)),
            })
            .unwrap();

        let err = ctx.run_script("while (true) {}", "spin.js").unwrap_err();
        assert!(matches!(err, RenderError::Timeout(100)));
    }
}
