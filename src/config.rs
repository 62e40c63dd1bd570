//! Gateway settings and the bundle configuration the binary renders with.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::json;
use url::Url;

use crate::api::RenderApi;
use crate::engine::ContextGlobals;
use crate::environment::{EnvironmentConfiguration, EnvironmentOptions, DEFAULT_CALLBACK_NAME};
use crate::loader::{FileLoader, FileSource, ResourceLoader, ScriptLoader, ScriptSource};
use crate::logging::Logger;
use crate::teardown::Closeable;
use crate::transport::{HttpTransport, Transport, TransportConfig};

/// Server-side rendering gateway
#[derive(Debug, Clone, Parser)]
#[command(name = "render-gateway", version, about)]
pub struct GatewayConfig {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Number of render worker threads
    #[arg(long, env = "RENDER_WORKERS", default_value_t = num_cpus::get())]
    pub workers: usize,

    /// Base URL the bundle scripts are served from
    #[arg(long, env = "RENDER_BUNDLE_URL", conflicts_with = "bundle_dir")]
    pub bundle_url: Option<Url>,

    /// Local folder holding the bundle scripts (development)
    #[arg(long, env = "RENDER_BUNDLE_DIR")]
    pub bundle_dir: Option<PathBuf>,

    /// Bundle scripts, in execution order
    #[arg(
        long = "script",
        env = "RENDER_SCRIPTS",
        value_delimiter = ',',
        required = true
    )]
    pub scripts: Vec<String>,

    /// Global function the bundle calls to register its render callback
    #[arg(long, env = "RENDER_CALLBACK_NAME", default_value = DEFAULT_CALLBACK_NAME)]
    pub callback_name: String,

    /// Timeout for each bundle request, in milliseconds
    #[arg(long, env = "RENDER_FETCH_TIMEOUT_MS", default_value_t = 60_000)]
    pub fetch_timeout_ms: u64,

    /// Retries for failed bundle requests
    #[arg(long, env = "RENDER_FETCH_RETRIES", default_value_t = 2)]
    pub fetch_retries: u32,

    /// Disable the bundle response cache
    #[arg(long, env = "RENDER_NO_CACHE")]
    pub no_cache: bool,

    /// Per-render time limit in milliseconds (0 disables it)
    #[arg(long, env = "RENDER_TIMEOUT_MS", default_value_t = 30_000)]
    pub render_timeout_ms: u64,

    /// Sandbox heap cap in megabytes (0 disables it)
    #[arg(long, env = "RENDER_MAX_HEAP_MB", default_value_t = 64)]
    pub max_heap_mb: usize,

    /// Shared secret required in the X-Render-Secret header
    #[arg(long, env = "RENDER_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// Value exposed to the bundle as process.env.NODE_ENV
    #[arg(long, env = "NODE_ENV", default_value = "production")]
    pub node_env: String,
}

impl GatewayConfig {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            timeout: Duration::from_millis(self.fetch_timeout_ms),
            retries: self.fetch_retries,
            cache: !self.no_cache,
            ..Default::default()
        }
    }

    pub fn environment_options(&self) -> EnvironmentOptions {
        EnvironmentOptions {
            registration_callback_name: self.callback_name.clone(),
            render_timeout: (self.render_timeout_ms > 0)
                .then(|| Duration::from_millis(self.render_timeout_ms)),
            max_heap_size: (self.max_heap_mb > 0).then(|| self.max_heap_mb * 1024 * 1024),
        }
    }

    /// Where bundle scripts come from. Exactly one source must be configured.
    pub fn bundle_source(&self) -> Result<BundleSource> {
        match (&self.bundle_url, &self.bundle_dir) {
            (Some(base), None) => {
                let transport = HttpTransport::new(self.transport_config())?;
                Ok(BundleSource::Remote {
                    base: base.clone(),
                    transport: Arc::new(transport),
                })
            }
            (None, Some(root)) => {
                // Fail at startup rather than on the first render.
                FileSource::new(root)
                    .with_context(|| format!("Bundle folder {} is unusable", root.display()))?;
                Ok(BundleSource::Local { root: root.clone() })
            }
            (Some(_), Some(_)) => Err(anyhow!("Configure either a bundle URL or a bundle folder, not both")),
            (None, None) => Err(anyhow!(
                "No bundle configured: set RENDER_BUNDLE_URL or RENDER_BUNDLE_DIR"
            )),
        }
    }
}

pub enum BundleSource {
    Remote {
        base: Url,
        transport: Arc<dyn Transport>,
    },
    Local {
        root: PathBuf,
    },
}

/// Renders with a fixed, ordered list of bundle scripts.
pub struct BundleConfiguration {
    scripts: Vec<String>,
    source: BundleSource,
    node_env: String,
    logger: Arc<dyn Logger>,
}

impl BundleConfiguration {
    pub fn new(
        scripts: Vec<String>,
        source: BundleSource,
        node_env: impl Into<String>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            scripts,
            source,
            node_env: node_env.into(),
            logger,
        }
    }

    pub fn from_config(config: &GatewayConfig, logger: Arc<dyn Logger>) -> Result<Self> {
        Ok(Self::new(
            config.scripts.clone(),
            config.bundle_source()?,
            config.node_env.clone(),
            logger,
        ))
    }
}

impl EnvironmentConfiguration for BundleConfiguration {
    async fn file_list(&self, _url: &Url, _api: &RenderApi) -> Result<Vec<String>> {
        match &self.source {
            BundleSource::Remote { base, .. } => self
                .scripts
                .iter()
                .map(|script| {
                    base.join(script)
                        .map(|url| url.to_string())
                        .with_context(|| format!("Invalid bundle script {:?}", script))
                })
                .collect(),
            BundleSource::Local { .. } => Ok(self.scripts.clone()),
        }
    }

    fn resource_loader(&self, _url: &Url, _api: &RenderApi) -> Result<Arc<dyn ResourceLoader>> {
        let logger = Arc::clone(&self.logger);
        match &self.source {
            BundleSource::Remote { transport, .. } => Ok(Arc::new(ScriptLoader::new(
                ScriptSource::new(Arc::clone(transport)),
                logger,
            ))),
            BundleSource::Local { root } => {
                let source = FileSource::new(root)
                    .with_context(|| format!("Bundle folder {} is unusable", root.display()))?;
                Ok(Arc::new(FileLoader::new(source, logger)))
            }
        }
    }

    async fn after_env_setup(
        &self,
        _url: &Url,
        _file_urls: &[String],
        _api: &RenderApi,
        context: &mut dyn ContextGlobals,
    ) -> Result<Option<Box<dyn Closeable>>> {
        context.set_global("process", json!({ "env": { "NODE_ENV": self.node_env } }))?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogger;

    fn parse(args: &[&str]) -> GatewayConfig {
        let mut argv = vec!["render-gateway"];
        argv.extend_from_slice(args);
        GatewayConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--bundle-url", "https://cdn.example.com/dist/", "--script", "a.js,b.js"]);
        assert_eq!(config.scripts, vec!["a.js", "b.js"]);
        assert_eq!(config.callback_name, DEFAULT_CALLBACK_NAME);

        let options = config.environment_options();
        assert_eq!(options.render_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.max_heap_size, Some(64 * 1024 * 1024));

        let transport = config.transport_config();
        assert_eq!(transport.retries, 2);
        assert!(transport.cache);
    }

    #[test]
    fn test_zero_disables_limits() {
        let config = parse(&[
            "--bundle-dir",
            ".",
            "--script",
            "a.js",
            "--render-timeout-ms",
            "0",
            "--max-heap-mb",
            "0",
            "--no-cache",
        ]);
        let options = config.environment_options();
        assert_eq!(options.render_timeout, None);
        assert_eq!(options.max_heap_size, None);
        assert!(!config.transport_config().cache);
    }

    #[test]
    fn test_bundle_url_and_dir_conflict() {
        let parsed = GatewayConfig::try_parse_from([
            "render-gateway",
            "--bundle-url",
            "https://cdn.example.com/",
            "--bundle-dir",
            ".",
            "--script",
            "a.js",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_missing_bundle_source() {
        let config = parse(&["--script", "a.js"]);
        assert!(config.bundle_source().is_err());
    }

    #[tokio::test]
    async fn test_remote_file_list_resolves_against_base() {
        let config = parse(&["--bundle-url", "https://cdn.example.com/dist/", "--script", "vendor.js,app.js"]);
        let logger: Arc<dyn Logger> = Arc::new(MemoryLogger::new());
        let bundle = BundleConfiguration::from_config(&config, Arc::clone(&logger)).unwrap();
        let url = Url::parse("https://example.com/page").unwrap();
        let api = RenderApi::new(Vec::<(String, String)>::new(), logger);

        let files = bundle.file_list(&url, &api).await.unwrap();
        assert_eq!(
            files,
            vec![
                "https://cdn.example.com/dist/vendor.js",
                "https://cdn.example.com/dist/app.js"
            ]
        );
    }

    #[test]
    fn test_missing_bundle_dir_fails_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let config = parse(&["--bundle-dir", missing.to_str().unwrap(), "--script", "a.js"]);
        assert!(config.bundle_source().is_err());
    }
}
