//! Adapter lifecycle management
//!
//! Tracks every open connection (CAN bus, OBD link, serial port) under a
//! name and guarantees orderly shutdown: `close_all` runs on scope exit,
//! logs per-adapter failures and always leaves the registry empty.

use tracing::{debug, info, warn};

use crate::error::Result;

/// Anything with a connection that must be released on exit. Adapters
/// expose exactly one capability: `close`.
pub trait Adapter: Send {
    fn close(&mut self) -> Result<()>;
}

/// Wrapper registering a bare CAN bus as an adapter.
pub struct CanBusAdapter(pub Box<dyn crate::can::CanBus>);

impl Adapter for CanBusAdapter {
    fn close(&mut self) -> Result<()> {
        self.0.close()
    }
}

/// Registry of active adapters keyed by name. Dropping the manager closes
/// everything, so placing one in a scope guarantees cleanup.
#[derive(Default)]
pub struct SessionManager {
    adapters: Vec<(String, Box<dyn Adapter>)>,
    active_channel: Option<String>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under a name. A previous entry under the same
    /// name is closed and replaced.
    pub fn register(&mut self, name: &str, adapter: Box<dyn Adapter>) {
        if let Some(pos) = self.adapters.iter().position(|(n, _)| n == name) {
            warn!("adapter '{name}' already registered, replacing");
            let (_, mut old) = self.adapters.remove(pos);
            if let Err(e) = old.close() {
                warn!("failed to close replaced adapter '{name}': {e}");
            }
        }
        debug!("registered adapter: {name}");
        self.adapters.push((name.to_string(), adapter));
    }

    /// Remove an adapter without closing it (it was closed by its owner).
    pub fn unregister(&mut self, name: &str) {
        if let Some(pos) = self.adapters.iter().position(|(n, _)| n == name) {
            self.adapters.remove(pos);
            debug!("unregistered adapter: {name}");
        }
    }

    /// Names of currently registered adapters.
    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Remember which channel is in use (e.g. "can0"), cleared by
    /// `close_all`.
    pub fn set_active_channel(&mut self, channel: &str) {
        self.active_channel = Some(channel.to_string());
    }

    pub fn active_channel(&self) -> Option<&str> {
        self.active_channel.as_deref()
    }

    /// Close every registered adapter. Failures are logged and cleanup
    /// continues; afterwards the registry is empty and the cached active
    /// channel is cleared.
    pub fn close_all(&mut self) {
        if self.adapters.is_empty() {
            debug!("no adapters registered, nothing to close");
        } else {
            info!("closing {} registered adapter(s)", self.adapters.len());
            let mut failures = 0;
            for (name, adapter) in self.adapters.iter_mut() {
                match adapter.close() {
                    Ok(()) => debug!("closed adapter '{name}'"),
                    Err(e) => {
                        warn!("failed to close adapter '{name}': {e}");
                        failures += 1;
                    }
                }
            }
            self.adapters.clear();
            if failures > 0 {
                warn!("{failures} adapter(s) failed to close cleanly");
            }
        }
        self.active_channel = None;
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
