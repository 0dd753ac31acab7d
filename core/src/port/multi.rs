// Multi-Port fan-out
//
// Presents a changing set of ports as a single port. Writes, drains and close
// go to every member; input from every member is merged into one listener.
// Members are keyed by name, and a name is registered at most once while its
// port is alive.

use super::{listener_slot, InputListener, ListenerSlot, Port, PortError, PortState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Forwards member input to the aggregate listener, one chunk at a time
struct MergedListener {
    target: ListenerSlot,
    delivery: Mutex<()>,
}

impl InputListener for MergedListener {
    fn data_received(&self, data: &[u8]) {
        let _serialized = self.delivery.lock();
        let target = self.target.read().clone();
        if let Some(target) = target {
            target.data_received(data);
        }
    }
}

pub struct MultiPort {
    name: String,
    ports: Mutex<HashMap<String, Arc<dyn Port>>>,
    merged: Arc<MergedListener>,
    closed: AtomicBool,
}

impl MultiPort {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ports: Mutex::new(HashMap::new()),
            merged: Arc::new(MergedListener {
                target: listener_slot(None),
                delivery: Mutex::new(()),
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.ports.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.ports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.lock().is_empty()
    }

    /// Names of all registered ports
    pub fn keys(&self) -> Vec<String> {
        self.ports.lock().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Port>> {
        self.ports.lock().get(key).cloned()
    }

    /// Register `port` under its own name.
    ///
    /// Returns false (and leaves the port untouched) if the name is taken or
    /// the multi port is closed.
    pub fn add(&self, port: Arc<dyn Port>) -> bool {
        let key = port.name().to_string();
        self.insert_with(&key, || Ok::<_, PortError>(port))
            .unwrap_or(false)
    }

    /// Register a port under `key`, constructing it only if `key` is free.
    ///
    /// The check and the insert happen under one lock, so concurrent callers
    /// can never create two ports for the same key.
    pub fn insert_with<F, E>(&self, key: &str, make: F) -> Result<bool, E>
    where
        F: FnOnce() -> Result<Arc<dyn Port>, E>,
    {
        let mut ports = self.ports.lock();
        if self.closed.load(Ordering::SeqCst) || ports.contains_key(key) {
            return Ok(false);
        }

        let port = make()?;
        port.set_listener(Some(self.merged.clone()));
        ports.insert(key.to_string(), port);
        info!("{}: added port {} ({} total)", self.name, key, ports.len());
        Ok(true)
    }

    /// Unregister and close the port stored under `key`
    pub fn remove(&self, key: &str) -> Option<Arc<dyn Port>> {
        let port = self.ports.lock().remove(key)?;
        port.set_listener(None);
        port.close();
        info!("{}: removed port {}", self.name, key);
        Some(port)
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn Port>)> {
        self.ports
            .lock()
            .iter()
            .map(|(key, port)| (key.clone(), port.clone()))
            .collect()
    }
}

impl Port for MultiPort {
    fn name(&self) -> &str {
        &self.name
    }

    /// Ready until closed; a failing member only affects itself
    fn state(&self) -> PortState {
        if self.closed.load(Ordering::SeqCst) {
            PortState::Failed
        } else {
            PortState::Ready
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PortError::Closed);
        }

        let mut dead = Vec::new();
        let mut accepted = 0;
        for (key, port) in self.snapshot() {
            if port.state() == PortState::Failed {
                dead.push(key);
                continue;
            }
            match port.write(data) {
                Ok(n) => accepted = accepted.max(n),
                Err(PortError::Closed) => dead.push(key),
                Err(e) => debug!("{}: write to {} failed: {}", self.name, key, e),
            }
        }

        for key in dead {
            debug!("{}: pruning dead port {}", self.name, key);
            self.remove(&key);
        }

        // Nothing took the bytes: report it as back-pressure
        Ok(accepted)
    }

    fn drain(&self) -> bool {
        self.snapshot()
            .into_iter()
            .fold(true, |all, (_, port)| port.drain() && all)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ports: Vec<(String, Arc<dyn Port>)> = self.ports.lock().drain().collect();
        for (key, port) in ports {
            port.close();
            debug!("{}: closed port {}", self.name, key);
        }
    }

    fn set_listener(&self, listener: Option<Arc<dyn InputListener>>) {
        *self.merged.target.write() = listener;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;
    use crate::port::MemoryPort;
    use std::time::Duration;

    fn memory_port(name: &str) -> Arc<MemoryPort> {
        Arc::new(MemoryPort::new(name, &PortConfig::default()).expect("Port"))
    }

    #[test]
    fn test_add_rejects_duplicate_names() {
        let multi = MultiPort::new("multi");
        assert!(multi.add(memory_port("a")));
        assert!(multi.add(memory_port("b")));
        assert!(!multi.add(memory_port("a")));

        assert_eq!(multi.len(), 2);
        assert!(multi.contains("a"));
        multi.close();
    }

    #[test]
    fn test_insert_with_skips_construction_for_known_key() {
        let multi = MultiPort::new("multi");
        multi.add(memory_port("a"));

        let result = multi.insert_with("a", || -> Result<Arc<dyn Port>, PortError> {
            panic!("must not construct a second port for a known key")
        });
        assert_eq!(result, Ok(false));
        multi.close();
    }

    #[test]
    fn test_merged_input_reaches_aggregate_listener() {
        let multi = MultiPort::new("multi");
        let a = memory_port("a");
        let b = memory_port("b");
        multi.add(a.clone());
        multi.add(b.clone());

        let seen = Arc::new(Mutex::new(Vec::<u8>::new()));
        let sink = seen.clone();
        multi.set_listener(Some(Arc::new(move |data: &[u8]| {
            sink.lock().extend_from_slice(data)
        })));

        a.send(b"AAAA").expect("Send a");
        b.send(b"BBBB").expect("Send b");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().len() < 8 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        let mut bytes = seen.lock().clone();
        bytes.sort_unstable();
        assert_eq!(bytes, b"AAAABBBB");
        multi.close();
    }

    #[test]
    fn test_write_prunes_closed_members() {
        let multi = MultiPort::new("multi");
        let a = memory_port("a");
        multi.add(a.clone());
        multi.add(memory_port("b"));

        a.close();
        assert_eq!(multi.write(b"hello"), Ok(5));
        assert!(!multi.contains("a"));
        assert!(multi.contains("b"));
        multi.close();
    }

    #[test]
    fn test_write_without_live_members_accepts_nothing() {
        let multi = MultiPort::new("multi");
        assert_eq!(multi.write(b"hello"), Ok(0));

        let a = memory_port("a");
        multi.add(a.clone());
        a.close();
        assert_eq!(multi.write(b"hello"), Ok(0));
        assert!(multi.is_empty());
        multi.close();
    }

    #[test]
    fn test_close_is_terminal() {
        let multi = MultiPort::new("multi");
        multi.add(memory_port("a"));
        multi.close();
        multi.close();

        assert_eq!(multi.state(), PortState::Failed);
        assert!(multi.is_empty());
        assert_eq!(multi.write(b"x"), Err(PortError::Closed));
        assert!(!multi.add(memory_port("c")));
    }
}
