//! Resource loaders: answer "give me the bytes for this URL" for a sandbox.
//!
//! A loader serves exactly one category of resource (script files) and answers
//! everything else with an empty buffer, never with nothing. It is either
//! active or closed; once closed, every fetch resolves empty, including fetches
//! that were already in flight, so no late bytes reach a torn-down sandbox.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::abort::{AbortableFetch, FetchError};
use crate::logging::Logger;
use crate::transport::Transport;

/// Per-render resource fetch backend.
pub trait ResourceLoader: Send + Sync {
    /// Fetch `url`. `None` means the loader has no answer at all, which the
    /// render environment treats as a broken loader.
    fn fetch(&self, url: &str) -> Option<AbortableFetch<Bytes>>;

    /// Stop serving. Idempotent.
    fn close(&self);

    fn is_active(&self) -> bool;
}

/// Where a [`GuardedLoader`] actually gets bytes from.
pub trait ResourceSource: Send + Sync {
    /// Whether this source serves `url` at all.
    fn accepts(&self, url: &str) -> bool;

    fn retrieve(&self, url: &str) -> AbortableFetch<Bytes>;
}

/// `data:` URLs are handled by the sandbox itself, never fetched.
pub fn is_inline_data(url: &str) -> bool {
    url.trim_start().starts_with("data:")
}

/// Script files: `.js` or `.mjs`, optionally followed by a query string or fragment.
pub fn is_script_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    path.ends_with(".js") || path.ends_with(".mjs")
}

/// The active/closed state machine shared by every loader.
pub struct GuardedLoader<S> {
    source: S,
    active: Arc<AtomicBool>,
    logger: Arc<dyn Logger>,
}

impl<S: ResourceSource> GuardedLoader<S> {
    pub fn new(source: S, logger: Arc<dyn Logger>) -> Self {
        Self {
            source,
            active: Arc::new(AtomicBool::new(true)),
            logger,
        }
    }

    fn empty() -> Option<AbortableFetch<Bytes>> {
        Some(AbortableFetch::ready(Bytes::new()))
    }
}

impl<S: ResourceSource> ResourceLoader for GuardedLoader<S> {
    fn fetch(&self, url: &str) -> Option<AbortableFetch<Bytes>> {
        let inline = is_inline_data(url);

        if !self.is_active() {
            if !inline {
                self.logger.warn(
                    &format!("Fetch attempted after resource loader close: {}", url),
                    None,
                );
            }
            return Self::empty();
        }

        if inline {
            return Self::empty();
        }

        if !self.source.accepts(url) {
            self.logger
                .silly(&format!("Resource not serviced by loader: {}", url), None);
            return Self::empty();
        }

        let active = Arc::clone(&self.active);
        let logger = Arc::clone(&self.logger);
        let requested = url.to_string();

        let fetch = self.source.retrieve(url).then(move |outcome, handle| {
            if handle.is_aborted() {
                return Ok(Bytes::new());
            }
            if !active.load(Ordering::SeqCst) {
                logger.info(
                    &format!("File requested but never used: {}", requested),
                    None,
                );
                return Ok(Bytes::new());
            }
            outcome
        });

        Some(fetch)
    }

    fn close(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.logger.silly("Resource loader closed", None);
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Script files fetched through the shared outbound transport.
pub struct ScriptSource {
    transport: Arc<dyn Transport>,
}

impl ScriptSource {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl ResourceSource for ScriptSource {
    fn accepts(&self, url: &str) -> bool {
        is_script_url(url)
    }

    fn retrieve(&self, url: &str) -> AbortableFetch<Bytes> {
        self.transport.fetch(url)
    }
}

/// Script files read from a local folder (development and tests).
///
/// Paths, relative or absolute, resolve against the root folder and may not
/// escape it.
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    /// Fails with `NotFound` unless `root` is an existing directory.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let canonical = root.as_ref().canonicalize().map_err(|e| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("Resource root '{}' not found: {}", root.as_ref().display(), e),
            )
        })?;

        if !canonical.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Resource root '{}' is not a directory", canonical.display()),
            ));
        }

        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, url: &str) -> io::Result<PathBuf> {
        let without_query = url.split(['?', '#']).next().unwrap_or_default();
        let raw = without_query.strip_prefix("file://").unwrap_or(without_query);
        let path = Path::new(raw);

        let candidate = if path.is_absolute() && path.starts_with(&self.root) {
            path.to_path_buf()
        } else {
            self.root.join(raw.trim_start_matches('/'))
        };

        let canonical = candidate.canonicalize()?;
        if !canonical.starts_with(&self.root) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("'{}' is outside the resource root", canonical.display()),
            ));
        }
        Ok(canonical)
    }
}

impl ResourceSource for FileSource {
    fn accepts(&self, url: &str) -> bool {
        is_script_url(url)
    }

    fn retrieve(&self, url: &str) -> AbortableFetch<Bytes> {
        let resolved = self.resolve(url);
        let requested = url.to_string();
        AbortableFetch::new(async move {
            let path = resolved.map_err(|source| FetchError::Io {
                path: requested.clone(),
                source,
            })?;
            tokio::fs::read(&path)
                .await
                .map(Bytes::from)
                .map_err(|source| FetchError::Io {
                    path: path.display().to_string(),
                    source,
                })
        })
    }
}

pub type ScriptLoader = GuardedLoader<ScriptSource>;
pub type FileLoader = GuardedLoader<FileSource>;
