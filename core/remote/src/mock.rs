//! Scripted transport for tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use synceddb_common::{Error, Result};

use crate::transport::{Method, RemoteRequest, RemoteResponse, RemoteTransport};

#[derive(Debug, Clone)]
enum Reply {
    Respond(RemoteResponse),
    Fail(String),
}

/// A mock transport for testing.
///
/// Replies are scripted per method and path. Replies queued for a route
/// are handed out in order and the last one repeats. Every request is
/// recorded, including the ones that fail.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    routes: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    requests: Mutex<Vec<RemoteRequest>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    /// Creates a new connected mock transport without routes.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Default::default()
        }
    }

    /// Queue a response for a route.
    pub fn respond(&self, method: Method, path: &str, response: RemoteResponse) -> &Self {
        self.push(method, path, Reply::Respond(response))
    }

    /// Queue a network failure for a route.
    pub fn fail(&self, method: Method, path: &str, message: &str) -> &Self {
        self.push(method, path, Reply::Fail(message.to_string()))
    }

    fn push(&self, method: Method, path: &str, reply: Reply) -> &Self {
        lock(&self.routes)
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
        self
    }

    /// Sets the connected state. A disconnected mock fails every call.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Hold the next request until the returned handle is notified.
    ///
    /// The request is recorded before it blocks, so callers can wait for
    /// [`MockTransport::request_count`] to move before releasing it.
    pub fn hold_next(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.gate) = Some(gate.clone());
        gate
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<RemoteRequest> {
        lock(&self.requests).clone()
    }

    /// Requests received for one route.
    pub fn requests_to(&self, method: Method, path: &str) -> Vec<RemoteRequest> {
        lock(&self.requests)
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .cloned()
            .collect()
    }

    /// Number of requests received.
    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    fn next_reply(&self, method: Method, path: &str) -> Option<Reply> {
        let mut routes = lock(&self.routes);
        let queue = routes.get_mut(&(method, path.to_string()))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let (method, path) = (request.method, request.path.clone());
        lock(&self.requests).push(request);

        let gate = lock(&self.gate).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::Network("mock transport not connected".to_string()));
        }

        match self.next_reply(method, &path) {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Fail(message)) => Err(Error::Network(message)),
            None => Err(Error::Network(format!(
                "no mock reply for {} {}",
                method, path
            ))),
        }
    }
}
