//! The per-request render life cycle.
//!
//! For every render a fresh sandbox context is built, the configured bundle
//! scripts are executed in list order, the registered render callback is
//! invoked, and everything that was created is torn down again, whatever the
//! outcome.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::api::RenderApi;
use crate::engine::{ContextGlobals, ContextSetup, DenoEngine, SandboxContext, SandboxEngine};
use crate::error::RenderError;
use crate::loader::ResourceLoader;
use crate::logging::Logger;
use crate::teardown::{Closeable, Teardown};
use crate::timers::TimerGate;

/// Registration function name used when none is configured
pub const DEFAULT_CALLBACK_NAME: &str = "__renderGatewayRegister";

/// Members every render result must carry
const RESULT_MEMBERS: [&str; 3] = ["body", "status", "headers"];

/// What a render produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResult {
    pub body: String,
    #[serde(deserialize_with = "status_code")]
    pub status: u16,
    pub headers: BTreeMap<String, String>,
}

fn status_code<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    if raw.fract() != 0.0 || !(0.0..=f64::from(u16::MAX)).contains(&raw) {
        return Err(serde::de::Error::custom(format!(
            "status must be an integer, got {}",
            raw
        )));
    }
    Ok(raw as u16)
}

/// Supplies what a render needs: the scripts to run, where to load them from,
/// and an optional hook to prepare the sandbox before they run.
#[allow(async_fn_in_trait)]
pub trait EnvironmentConfiguration: Send + Sync {
    /// Ordered list of script URLs to execute for `url`.
    async fn file_list(&self, url: &Url, api: &RenderApi) -> anyhow::Result<Vec<String>>;

    /// A fresh loader, owned by a single render.
    fn resource_loader(&self, url: &Url, api: &RenderApi)
        -> anyhow::Result<Arc<dyn ResourceLoader>>;

    /// Runs after the sandbox is built and before any bundle script.
    ///
    /// A returned closeable is closed during teardown, ahead of the sandbox.
    async fn after_env_setup(
        &self,
        url: &Url,
        file_urls: &[String],
        api: &RenderApi,
        context: &mut dyn ContextGlobals,
    ) -> anyhow::Result<Option<Box<dyn Closeable>>> {
        let _ = (url, file_urls, api, context);
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct EnvironmentOptions {
    /// Global function bundle scripts call to register their render callback.
    pub registration_callback_name: String,
    pub render_timeout: Option<Duration>,
    /// V8 heap cap in bytes
    pub max_heap_size: Option<usize>,
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self {
            registration_callback_name: DEFAULT_CALLBACK_NAME.to_string(),
            render_timeout: None,
            max_heap_size: None,
        }
    }
}

/// Renders URLs by running a configured bundle inside fresh sandboxes.
pub struct SandboxEnvironment<C, E = DenoEngine> {
    configuration: Arc<C>,
    engine: E,
    options: EnvironmentOptions,
    logger: Arc<dyn Logger>,
}

impl<C, E> SandboxEnvironment<C, E>
where
    C: EnvironmentConfiguration,
    E: SandboxEngine,
{
    pub fn new(
        configuration: Arc<C>,
        engine: E,
        options: EnvironmentOptions,
        logger: Arc<dyn Logger>,
    ) -> Result<Self, RenderError> {
        validate_callback_name(&options.registration_callback_name)?;
        Ok(Self {
            configuration,
            engine,
            options,
            logger,
        })
    }

    pub fn options(&self) -> &EnvironmentOptions {
        &self.options
    }

    /// Render `url`. Everything created for the render is closed before this
    /// returns, on success and on failure alike.
    pub async fn render(&self, url: &Url, api: &RenderApi) -> Result<RenderResult, RenderError> {
        self.logger.debug(&format!("Rendering {}", url), None);

        let mut teardown = Teardown::new(Arc::clone(&self.logger));
        let mut loader: Option<Arc<dyn ResourceLoader>> = None;
        let mut context: Option<E::Context> = None;

        let outcome = self
            .run(url, api, &mut teardown, &mut loader, &mut context)
            .await;

        match context.as_mut() {
            Some(ctx) => {
                // Give callbacks already queued by the render one turn to run
                // before the context is closed underneath them.
                if !matches!(outcome, Err(RenderError::Timeout(_))) {
                    tokio::task::yield_now().await;
                    ctx.settle(Duration::ZERO).await;
                }
            }
            // The sandbox never took ownership of the loader.
            None => {
                if let Some(loader) = loader.as_ref() {
                    loader.close();
                }
            }
        }
        teardown.close_all();
        drop(context);

        if let Err(err) = &outcome {
            self.logger.debug(
                &format!("Render of {} failed: {}", url, err),
                Some(&json!({ "kind": err.kind() })),
            );
        }
        outcome
    }

    async fn run(
        &self,
        url: &Url,
        api: &RenderApi,
        teardown: &mut Teardown,
        loader_slot: &mut Option<Arc<dyn ResourceLoader>>,
        context_slot: &mut Option<E::Context>,
    ) -> Result<RenderResult, RenderError> {
        // Resolve inputs
        let loader = self
            .configuration
            .resource_loader(url, api)
            .map_err(|e| hook_error(e, "resource_loader"))?;
        *loader_slot = Some(Arc::clone(&loader));

        let (files, bodies) = {
            let mut session = api.trace("file acquisition");
            let files = self
                .configuration
                .file_list(url, api)
                .await
                .map_err(|e| hook_error(e, "file_list"))?;
            session.add_label("files", files.len().to_string());
            let bodies = fetch_all(loader.as_ref(), &files).await?;
            session.end();
            (files, bodies)
        };

        // Build the sandbox
        let ctx = context_slot.insert(self.engine.create_context(ContextSetup {
            url: url.clone(),
            loader,
            logger: Arc::clone(&self.logger),
            api: api.clone(),
            max_heap_size: self.options.max_heap_size,
            render_timeout: self.options.render_timeout,
        })?);
        teardown.register("sandbox context", ctx.closer());

        // Patch timers
        let gate = TimerGate::new(Arc::clone(&self.logger));
        ctx.patch_timers(gate.clone())?;
        teardown.register("timer gate", Box::new(gate));

        // After-setup hook
        let hook = self
            .configuration
            .after_env_setup(url, &files, api, ctx as &mut dyn ContextGlobals)
            .await
            .map_err(|e| hook_error(e, "after_env_setup"))?;
        if let Some(closeable) = hook {
            teardown.register("after-setup hook", closeable);
        }

        // Registration point, then the bundle in list order
        ctx.install_registration(&self.options.registration_callback_name)?;
        for (file, body) in files.iter().zip(bodies.iter()) {
            ctx.run_script(&String::from_utf8_lossy(body), file)?;
        }
        if !ctx.has_render_callback()? {
            return Err(RenderError::NoRenderCallback);
        }

        // Invoke and validate
        let value = {
            let _session = api.trace("render");
            ctx.invoke_render().await?
        };
        validate_result(value)
    }
}

/// Fetch every listed file concurrently; results keep list order.
async fn fetch_all(
    loader: &dyn ResourceLoader,
    files: &[String],
) -> Result<Vec<Bytes>, RenderError> {
    let mut fetches = Vec::with_capacity(files.len());
    for file in files {
        let fetch = loader
            .fetch(file)
            .ok_or_else(|| RenderError::ResourceLoaderViolation { url: file.clone() })?;
        fetches.push(fetch);
    }

    join_all(fetches)
        .await
        .into_iter()
        .zip(files)
        .map(|(result, file)| {
            result.map_err(|e| RenderError::ResourceNotFound {
                url: file.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Check the shape of what the render callback resolved to.
///
/// Only presence of the three members is required here; HTTP semantics are
/// checked by the handler.
pub fn validate_result(value: Value) -> Result<RenderResult, RenderError> {
    let Value::Object(members) = &value else {
        return Err(RenderError::MalformedResult(format!(
            "expected an object with body, status and headers, got {}",
            value
        )));
    };
    let missing: Vec<&str> = RESULT_MEMBERS
        .iter()
        .copied()
        .filter(|name| !members.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        return Err(RenderError::MalformedResult(format!(
            "missing {}",
            missing.join(", ")
        )));
    }
    serde_json::from_value(value).map_err(|e| RenderError::MalformedResult(e.to_string()))
}

/// Registration names must be plain JavaScript identifiers.
fn validate_callback_name(name: &str) -> Result<(), RenderError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == '$' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(RenderError::ConfigInvalid(format!(
            "registration callback name {:?} is not a valid identifier",
            name
        )))
    }
}

/// Configuration hooks return `anyhow`; keep render errors they propagated intact.
fn hook_error(err: anyhow::Error, hook: &str) -> RenderError {
    match err.downcast::<RenderError>() {
        Ok(render) => render,
        Err(other) => RenderError::Engine(other.context(format!("{} failed", hook))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_result_accepts_complete_object() {
        let result = validate_result(json!({
            "body": "<p>ok</p>",
            "status": 200,
            "headers": { "Content-Type": "text/html" }
        }))
        .unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.headers["Content-Type"], "text/html");
    }

    #[test]
    fn test_validate_result_reports_missing_members() {
        let err = validate_result(json!({ "body": "" })).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Malformed render result"));
        assert!(message.contains("status"));
        assert!(message.contains("headers"));

        assert!(matches!(
            validate_result(json!("body")),
            Err(RenderError::MalformedResult(_))
        ));
        assert!(matches!(
            validate_result(Value::Null),
            Err(RenderError::MalformedResult(_))
        ));
    }

    #[test]
    fn test_validate_result_accepts_float_status() {
        let result = validate_result(json!({ "body": "", "status": 404.0, "headers": {} })).unwrap();
        assert_eq!(result.status, 404);
        assert!(validate_result(json!({ "body": "", "status": 200.5, "headers": {} })).is_err());
    }

    #[test]
    fn test_callback_name_validation() {
        assert!(validate_callback_name(DEFAULT_CALLBACK_NAME).is_ok());
        assert!(validate_callback_name("$register1").is_ok());
        assert!(validate_callback_name("").is_err());
        assert!(validate_callback_name("1abc").is_err());
        assert!(validate_callback_name("a-b").is_err());
        assert!(validate_callback_name("x; alert(1)").is_err());
    }

    #[test]
    fn test_hook_error_preserves_render_errors() {
        let err = hook_error(anyhow::Error::new(RenderError::NoRenderCallback), "after_env_setup");
        assert!(matches!(err, RenderError::NoRenderCallback));

        let err = hook_error(anyhow::anyhow!("disk on fire"), "file_list");
        assert!(err.to_string().contains("file_list failed"));
    }
}
