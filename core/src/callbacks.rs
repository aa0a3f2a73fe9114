//! Callback system for circuit breaker state transitions

use crate::CircuitState;
use std::sync::Arc;

type NameCallback = Arc<dyn Fn(&str) + Send + Sync>;
type TransitionCallback = Arc<dyn Fn(&StateTransition) + Send + Sync>;

/// A completed state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub circuit: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Callbacks for circuit breaker events
///
/// Callbacks run after the breaker lock is released, so they may safely
/// query the breaker that invoked them.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<NameCallback>,
    pub on_close: Option<NameCallback>,
    pub on_half_open: Option<NameCallback>,
    pub on_transition: Option<TransitionCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch a transition to the state-specific and generic callbacks
    pub fn fire(&self, transition: &StateTransition) {
        let specific = match transition.to {
            CircuitState::Open => &self.on_open,
            CircuitState::Closed => &self.on_close,
            CircuitState::HalfOpen => &self.on_half_open,
        };

        if let Some(callback) = specific {
            callback(&transition.circuit);
        }
        if let Some(callback) = &self.on_transition {
            callback(transition);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .field("on_transition", &self.on_transition.is_some())
            .finish()
    }
}
