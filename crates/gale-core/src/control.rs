//! Control-plane collaborator interface.
//!
//! The runtime core never reads configuration from this surface after
//! construction; it only publishes counters and registers debug probes.
//! Hosts wire in their own implementation (hot reload, metrics export,
//! debug endpoints); [`NoopControl`] is the default stand-in.

use std::collections::HashMap;
use std::sync::Arc;

/// Callback invoked when the host reloads configuration.
pub type ReloadHook = Box<dyn Fn() + Send + Sync>;

/// A named counter sampled on demand by the host.
pub type DebugProbe = Box<dyn Fn() -> u64 + Send + Sync>;

/// Host-provided control plane.
pub trait Control: Send + Sync {
    /// Current configuration as a flat key/value map.
    fn get_config(&self) -> HashMap<String, String>;

    /// Replaces configuration values.
    fn set_config(&self, values: HashMap<String, String>);

    /// Aggregated counters published by runtime components.
    fn stats(&self) -> HashMap<String, u64>;

    /// Registers a hook run after each configuration reload.
    fn on_reload(&self, hook: ReloadHook);

    /// Registers a named probe the host may sample for debugging.
    fn register_debug_probe(&self, name: &str, probe: DebugProbe);
}

/// Control plane that ignores everything. Used when the host does not wire
/// one in.
#[derive(Default)]
pub struct NoopControl;

impl Control for NoopControl {
    fn get_config(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    fn set_config(&self, _values: HashMap<String, String>) {}

    fn stats(&self) -> HashMap<String, u64> {
        HashMap::new()
    }

    fn on_reload(&self, _hook: ReloadHook) {}

    fn register_debug_probe(&self, _name: &str, _probe: DebugProbe) {}
}

/// Shared handle to a control plane.
pub type ControlHandle = Arc<dyn Control>;
