//! # Render Gateway
//!
//! Server-side rendering for JavaScript bundles using deno_core.
//!
//! Each render runs in a fresh sandbox: the bundle scripts are fetched through
//! a per-request resource loader, executed in list order, and the render
//! callback they register is invoked with a small request API. Everything the
//! render created is closed again before the result is returned.
//!
//! ## Guarantees
//!
//! - **Ordered execution**: scripts run in file-list order, however their
//!   fetches complete
//! - **No late bytes**: once a loader is closed, in-flight and new fetches
//!   resolve empty
//! - **No dangling timers**: timer callbacks are skipped after teardown
//! - **Total teardown**: every registered closeable is closed exactly once,
//!   in reverse order, on every outcome
//!
//! ## Usage
//!
//! ```rust,ignore
//! use render_gateway::{RenderApi, SandboxEnvironment, DenoEngine, EnvironmentOptions};
//!
//! let environment = SandboxEnvironment::new(
//!     Arc::new(my_configuration),
//!     DenoEngine,
//!     EnvironmentOptions::default(),
//!     logger.clone(),
//! )?;
//! let api = RenderApi::new(request_headers, logger);
//! let result = environment.render(&url, &api).await?;
//! println!("{} {}", result.status, result.body);
//! ```

pub mod abort;
pub mod api;
pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod handler;
pub mod loader;
pub mod logging;
pub mod pool;
pub mod teardown;
pub mod testing;
pub mod timers;
pub mod transport;

pub use abort::{AbortHandle, AbortableFetch, FetchError};
pub use api::{RenderApi, TraceSession};
pub use config::{BundleConfiguration, BundleSource, GatewayConfig};
pub use engine::{ContextGlobals, DenoEngine, SandboxContext, SandboxEngine};
pub use environment::{
    EnvironmentConfiguration, EnvironmentOptions, RenderResult, SandboxEnvironment,
};
pub use error::{ErrorInfo, RenderError};
pub use handler::AppState;
pub use loader::{FileLoader, GuardedLoader, ResourceLoader, ScriptLoader};
pub use logging::{LogLevel, Logger, MemoryLogger, TracingLogger, VirtualConsole};
pub use pool::RenderPool;
pub use teardown::{Closeable, Teardown};
pub use timers::TimerGate;
pub use transport::{HttpTransport, Transport, TransportConfig};
