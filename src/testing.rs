//! An in-memory [`ResourceLoader`] for exercising render environments
//! without a network or a bundle directory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::abort::AbortableFetch;
use crate::loader::ResourceLoader;

#[derive(Clone)]
enum Entry {
    Body(Bytes, Duration),
    /// The loader gives no answer for this URL.
    NoAnswer,
}

struct Inner {
    files: HashMap<String, Entry>,
    events: Mutex<Vec<String>>,
    active: AtomicBool,
}

/// Serves fixed bodies by exact URL and records what happened to it.
///
/// Unknown URLs resolve to an empty body. Events recorded: `fetched <url>`
/// when a body is delivered, and `loader closed` on the first close.
#[derive(Clone)]
pub struct MemoryLoader {
    inner: Arc<Inner>,
}

impl Default for MemoryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                files: HashMap::new(),
                events: Mutex::new(Vec::new()),
                active: AtomicBool::new(true),
            }),
        }
    }

    fn with_entry(self, url: &str, entry: Entry) -> Self {
        let mut files = self.inner.files.clone();
        files.insert(url.to_string(), entry);
        Self {
            inner: Arc::new(Inner {
                files,
                events: Mutex::new(self.events()),
                active: AtomicBool::new(self.is_active()),
            }),
        }
    }

    pub fn with_file(self, url: &str, body: &str) -> Self {
        self.with_delayed_file(url, body, Duration::ZERO)
    }

    /// Serve `body` for `url` after `delay`.
    pub fn with_delayed_file(self, url: &str, body: &str, delay: Duration) -> Self {
        let body = Bytes::copy_from_slice(body.as_bytes());
        self.with_entry(url, Entry::Body(body, delay))
    }

    /// Make `fetch(url)` return no answer at all.
    pub fn without_answer(self, url: &str) -> Self {
        self.with_entry(url, Entry::NoAnswer)
    }

    pub fn record(&self, event: impl Into<String>) {
        if let Ok(mut events) = self.inner.events.lock() {
            events.push(event.into());
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.inner
            .events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl ResourceLoader for MemoryLoader {
    fn fetch(&self, url: &str) -> Option<AbortableFetch<Bytes>> {
        if !self.is_active() {
            return Some(AbortableFetch::ready(Bytes::new()));
        }
        match self.inner.files.get(url).cloned() {
            None => Some(AbortableFetch::ready(Bytes::new())),
            Some(Entry::NoAnswer) => None,
            Some(Entry::Body(body, delay)) => {
                let loader = self.clone();
                let url = url.to_string();
                Some(AbortableFetch::new(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    loader.record(format!("fetched {}", url));
                    Ok(body)
                }))
            }
        }
    }

    fn close(&self) {
        if self.inner.active.swap(false, Ordering::SeqCst) {
            self.record("loader closed");
        }
    }

    fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_loader_answers() {
        let loader = MemoryLoader::new()
            .with_file("a.js", "1")
            .without_answer("b.js");

        assert_eq!(loader.fetch("a.js").unwrap().await.unwrap(), Bytes::from("1"));
        assert!(loader.fetch("b.js").is_none());
        assert!(loader.fetch("c.js").unwrap().await.unwrap().is_empty());

        loader.close();
        loader.close();
        assert!(loader.fetch("a.js").unwrap().await.unwrap().is_empty());
        assert_eq!(loader.events(), vec!["fetched a.js", "loader closed"]);
    }
}
