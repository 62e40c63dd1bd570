//! Reverse-order cleanup of everything a render created.

use std::sync::Arc;

use crate::logging::Logger;

/// A resource registered for cleanup when a render finishes.
///
/// `close` defaults to a no-op so inert entries need no special casing.
pub trait Closeable {
    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Stack of closeables, closed last-registered first.
pub struct Teardown {
    entries: Vec<(&'static str, Box<dyn Closeable>)>,
    logger: Arc<dyn Logger>,
}

impl Teardown {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            entries: Vec::new(),
            logger,
        }
    }

    pub fn register(&mut self, label: &'static str, closeable: Box<dyn Closeable>) {
        self.entries.push((label, closeable));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close every entry in reverse registration order.
    ///
    /// A failing entry is logged and the rest are still closed.
    pub fn close_all(&mut self) {
        while let Some((label, mut closeable)) = self.entries.pop() {
            if let Err(err) = closeable.close() {
                self.logger.error(
                    &format!("Failed to close {}: {:#}", label, err),
                    Some(&serde_json::json!({ "closeable": label })),
                );
            }
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogLevel, MemoryLogger};
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl Closeable for Recorder {
        fn close(&mut self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                anyhow::bail!("{} refused to close", self.name);
            }
            Ok(())
        }
    }

    struct Inert;
    impl Closeable for Inert {}

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Box<dyn Closeable> {
        Box::new(Recorder {
            name,
            log: Arc::clone(log),
            fail,
        })
    }

    #[test]
    fn test_closes_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut teardown = Teardown::new(Arc::new(MemoryLogger::new()));
        teardown.register("first", recorder("first", &log, false));
        teardown.register("inert", Box::new(Inert));
        teardown.register("second", recorder("second", &log, false));
        teardown.register("third", recorder("third", &log, false));

        teardown.close_all();
        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
        assert!(teardown.is_empty());
    }

    #[test]
    fn test_failure_does_not_stop_cleanup() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let logger = MemoryLogger::new();
        let mut teardown = Teardown::new(Arc::new(logger.clone()));
        teardown.register("first", recorder("first", &log, false));
        teardown.register("broken", recorder("broken", &log, true));
        teardown.register("third", recorder("third", &log, false));

        teardown.close_all();
        assert_eq!(*log.lock().unwrap(), vec!["third", "broken", "first"]);
        assert_eq!(logger.matching(LogLevel::Error, "Failed to close broken").len(), 1);
    }

    #[test]
    fn test_each_entry_closed_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let mut teardown = Teardown::new(Arc::new(MemoryLogger::new()));
            teardown.register("only", recorder("only", &log, false));
            teardown.close_all();
            teardown.close_all();
        }
        assert_eq!(*log.lock().unwrap(), vec!["only"]);
    }
}
