//! Signal hooks: callbacks run around the built-in signal handling.
//!
//! Hooks are registered per phase and per signal before the server starts
//! serving, then only read. A signal with no hooks is not an error.

use std::collections::HashMap;
use std::sync::Arc;

use crate::lifecycle::signals::Signal;

/// When a hook runs relative to the built-in handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Pre,
    Post,
}

pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Ordered callbacks keyed by phase, then by signal.
#[derive(Clone, Default)]
pub struct SignalHooks {
    table: HashMap<HookPhase, HashMap<Signal, Vec<Hook>>>,
}

impl SignalHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback for `signal` in `phase`.
    pub fn register<F>(&mut self, phase: HookPhase, signal: Signal, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.table
            .entry(phase)
            .or_default()
            .entry(signal)
            .or_default()
            .push(Arc::new(hook));
    }

    /// Run the callbacks for `signal` in `phase`, in registration order.
    pub fn fire(&self, phase: HookPhase, signal: Signal) {
        let Some(hooks) = self.table.get(&phase).and_then(|by_signal| by_signal.get(&signal)) else {
            return;
        };
        for hook in hooks {
            hook();
        }
    }

    pub fn count(&self, phase: HookPhase, signal: Signal) -> usize {
        self.table
            .get(&phase)
            .and_then(|by_signal| by_signal.get(&signal))
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for SignalHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (phase, by_signal) in &self.table {
            for (signal, hooks) in by_signal {
                map.entry(&(phase, signal), &hooks.len());
            }
        }
        map.finish()
    }
}
