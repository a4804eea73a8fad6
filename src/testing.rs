//! In-memory stand-ins for the network, the tunnel and the port-change command

use crate::hooks::CommandHook;
use crate::pia::models::Connection;
use crate::pia::transport::{Request, Response, Transport, TransportError};
use crate::wireguard::{PrivateKey, TrafficStats, TunnelError, TunnelSupervisor};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};

type Failure = Arc<dyn Fn() -> TransportError + Send + Sync>;
type Reply = Result<Response, Failure>;

/// Scripted transport keyed by `Request::route`.
///
/// Replies for a route are served in order and the last one repeats.
/// Unscripted routes answer 404.
#[derive(Default)]
pub struct FakeTransport {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<Request>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, route: &str, status: u16, body: impl Into<String>) {
        self.push(route, Ok(Response::new(status, body)));
    }

    pub fn fail(&self, route: &str, message: &str) {
        let message = message.to_string();
        self.fail_with(route, move || TransportError::Connect(message.clone()));
    }

    pub fn fail_with(
        &self,
        route: &str,
        error: impl Fn() -> TransportError + Send + Sync + 'static,
    ) {
        self.push(route, Err(Arc::new(error)));
    }

    fn push(&self, route: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(route.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, route: &str) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.route() == route)
            .collect()
    }

    pub fn count(&self, route: &str) -> usize {
        self.requests_to(route).len()
    }

    fn next_reply(&self, route: &str) -> Option<Reply> {
        let mut replies = self.replies.lock().unwrap();
        let queue = replies.get_mut(route)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl Transport for FakeTransport {
    async fn get(&self, request: Request) -> Result<Response, TransportError> {
        let route = request.route().to_string();
        self.requests.lock().unwrap().push(request);
        match self.next_reply(&route) {
            Some(Ok(response)) => Ok(response),
            Some(Err(error)) => Err(error()),
            None => Ok(Response::new(404, "")),
        }
    }
}

/// Tunnel that exists only in memory
pub struct FakeSupervisor {
    config: RefCell<Option<Connection>>,
    active: Cell<bool>,
    bring_up_results: RefCell<VecDeque<bool>>,
    bring_up_calls: Cell<usize>,
    writes: Cell<usize>,
    removals: Cell<usize>,
    removal_error: Cell<Option<fn() -> TunnelError>>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self {
            config: RefCell::new(None),
            active: Cell::new(false),
            bring_up_results: RefCell::new(VecDeque::new()),
            bring_up_calls: Cell::new(0),
            writes: Cell::new(0),
            removals: Cell::new(0),
            removal_error: Cell::new(None),
        }
    }

    /// Start with a config written and the interface up
    pub fn install(&self, connection: Connection) {
        *self.config.borrow_mut() = Some(connection);
        self.active.set(true);
    }

    /// Results for the next `bring_up` calls; after that it succeeds
    pub fn queue_bring_up(&self, results: &[bool]) {
        self.bring_up_results.borrow_mut().extend(results);
    }

    /// Make every `remove_config` fail with `error`. An `Io` error leaves the
    /// config in place; anything else still removes it.
    pub fn fail_removals(&self, error: fn() -> TunnelError) {
        self.removal_error.set(Some(error));
    }

    pub fn bring_up_calls(&self) -> usize {
        self.bring_up_calls.get()
    }

    pub fn writes(&self) -> usize {
        self.writes.get()
    }

    pub fn removals(&self) -> usize {
        self.removals.get()
    }
}

impl TunnelSupervisor for FakeSupervisor {
    fn config_exists(&self) -> bool {
        self.config.borrow().is_some()
    }

    async fn interface_active(&self) -> bool {
        self.active.get()
    }

    async fn bring_up(&self) -> bool {
        self.bring_up_calls.set(self.bring_up_calls.get() + 1);
        let up = self.bring_up_results.borrow_mut().pop_front().unwrap_or(true);
        self.active.set(up);
        up
    }

    async fn bring_down(&self) -> Result<(), TunnelError> {
        self.active.set(false);
        Ok(())
    }

    fn write_config(
        &self,
        connection: &Connection,
        _private_key: &PrivateKey,
    ) -> Result<(), TunnelError> {
        self.writes.set(self.writes.get() + 1);
        *self.config.borrow_mut() = Some(connection.clone());
        Ok(())
    }

    async fn remove_config(&self) -> Result<(), TunnelError> {
        self.removals.set(self.removals.get() + 1);
        self.active.set(false);
        match self.removal_error.get().map(|error| error()) {
            Some(e @ TunnelError::Io { .. }) => Err(e),
            Some(e) => {
                *self.config.borrow_mut() = None;
                Err(e)
            }
            None => {
                *self.config.borrow_mut() = None;
                Ok(())
            }
        }
    }

    fn read_connection(&self) -> Result<Option<Connection>, TunnelError> {
        Ok(self.config.borrow().clone())
    }

    async fn traffic_stats(&self) -> Option<TrafficStats> {
        None
    }
}

/// Records commands instead of running them; they all "succeed"
#[derive(Default)]
pub struct RecordingHook {
    commands: RefCell<Vec<String>>,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl CommandHook for RecordingHook {
    async fn run(&self, command: &str) -> io::Result<ExitStatus> {
        self.commands.borrow_mut().push(command.to_string());
        Ok(ExitStatus::from_raw(0))
    }
}

/// (id, name, port_forward, [(cn, ip)])
pub type RegionSpec<'a> = (&'a str, &'a str, bool, &'a [(&'a str, &'a str)]);

/// A region list download: the JSON line, then filler standing in for the
/// provider's signature so the body clears the minimum length
pub fn region_list_body(regions: &[RegionSpec<'_>]) -> String {
    let regions: Vec<_> = regions
        .iter()
        .map(|(id, name, port_forward, servers)| {
            let servers: Vec<_> = servers
                .iter()
                .map(|(cn, ip)| json!({"cn": cn, "ip": ip}))
                .collect();
            json!({
                "id": id,
                "name": name,
                "port_forward": port_forward,
                "servers": {"wg": servers, "ovpnudp": []},
            })
        })
        .collect();
    let document = json!({"groups": {}, "regions": regions});
    format!("{}\n\n{}", document, "A".repeat(1024))
}
