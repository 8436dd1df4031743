//! Named checkpoints where policy code inspects or rewrites a flow.
//!
//! Listeners run synchronously on the connection's task and get the flow by
//! mutable reference; the orchestrator continues once the last listener for
//! an event has returned. A [`Hooks`] registry is immutable after
//! [`HooksBuilder::build`], so one `Arc<Hooks>` is shared by every connection.

use std::collections::HashMap;
use std::fmt;

use tracing::trace;

use crate::protocol::Flow;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HookEvent {
    HttpConnect,
    RequestHeaders,
    Request,
    WebsocketHandshake,
    ResponseHeaders,
    Response,
    Error,
}

impl HookEvent {
    pub const ALL: [HookEvent; 7] = [
        HookEvent::HttpConnect,
        HookEvent::RequestHeaders,
        HookEvent::Request,
        HookEvent::WebsocketHandshake,
        HookEvent::ResponseHeaders,
        HookEvent::Response,
        HookEvent::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::HttpConnect => "http_connect",
            HookEvent::RequestHeaders => "requestheaders",
            HookEvent::Request => "request",
            HookEvent::WebsocketHandshake => "websocket_handshake",
            HookEvent::ResponseHeaders => "responseheaders",
            HookEvent::Response => "response",
            HookEvent::Error => "error",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait Hook: Send + Sync {
    fn call(&self, flow: &mut Flow);
}

#[derive(Debug)]
pub struct HookFn<F> {
    f: F,
}

impl<F> Hook for HookFn<F>
where
    F: Fn(&mut Flow) + Send + Sync,
{
    fn call(&self, flow: &mut Flow) {
        (self.f)(flow);
    }
}

pub fn hook_fn<F>(f: F) -> HookFn<F>
where
    F: Fn(&mut Flow) + Send + Sync,
{
    HookFn { f }
}

pub struct Hooks {
    listeners: HashMap<HookEvent, Vec<Box<dyn Hook>>>,
}

impl Hooks {
    pub fn builder() -> HooksBuilder {
        HooksBuilder::new()
    }

    pub fn empty() -> Self {
        Self { listeners: HashMap::new() }
    }

    /// Runs every listener registered for `event`, in registration order.
    pub fn ask(&self, event: HookEvent, flow: &mut Flow) {
        let Some(listeners) = self.listeners.get(&event) else {
            return;
        };
        trace!(event = %event, listeners = listeners.len(), "dispatch hook");
        for listener in listeners {
            listener.call(flow);
        }
    }

    pub fn has_listeners(&self, event: HookEvent) -> bool {
        self.listeners.get(&event).is_some_and(|listeners| !listeners.is_empty())
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for event in HookEvent::ALL {
            if let Some(listeners) = self.listeners.get(&event) {
                map.entry(&event.as_str(), &listeners.len());
            }
        }
        map.finish()
    }
}

pub struct HooksBuilder {
    listeners: HashMap<HookEvent, Vec<Box<dyn Hook>>>,
}

impl HooksBuilder {
    fn new() -> Self {
        Self { listeners: HashMap::new() }
    }

    pub fn add_last<H: Hook + 'static>(mut self, event: HookEvent, hook: H) -> Self {
        self.listeners.entry(event).or_default().push(Box::new(hook));
        self
    }

    pub fn add_first<H: Hook + 'static>(mut self, event: HookEvent, hook: H) -> Self {
        self.listeners.entry(event).or_default().insert(0, Box::new(hook));
        self
    }

    /// Shorthand for `add_last(event, hook_fn(f))`.
    pub fn on<F>(self, event: HookEvent, f: F) -> Self
    where
        F: Fn(&mut Flow) + Send + Sync + 'static,
    {
        self.add_last(event, hook_fn(f))
    }

    pub fn build(self) -> Hooks {
        Hooks { listeners: self.listeners }
    }
}

impl fmt::Debug for HooksBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HooksBuilder").field("events", &self.listeners.len()).finish()
    }
}
