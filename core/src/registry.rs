//! Keyed collection of call gates
//!
//! The registry is plain data owned by the wiring layer and passed to
//! whoever needs it. There is no process-wide instance.

use crate::circuit::FallbackContext;
use crate::errors::{ConfigError, GateError};
use crate::gate::{CallContext, CallGate, GateMetrics};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default)]
pub struct Registry {
    gates: HashMap<String, Arc<CallGate>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a gate under its own name
    pub fn register(&mut self, gate: Arc<CallGate>) -> Result<(), ConfigError> {
        let name = gate.name().to_string();
        if self.gates.contains_key(&name) {
            return Err(ConfigError::DuplicateGate(name));
        }

        info!(gate = %name, "gate registered");
        self.gates.insert(name, gate);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<CallGate>> {
        self.gates.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.gates.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Run `body` through the gate registered under `key`
    pub async fn execute<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        key: &str,
        body: F,
    ) -> Result<T, GateError<E>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        match self.gates.get(key) {
            Some(gate) => gate.execute(ctx, body).await,
            None => Err(GateError::UnknownGate(key.to_string())),
        }
    }

    /// Install the fallback used by `key` on terminal rejection
    pub fn register_fallback<T, E, F>(&self, key: &str, fallback: F) -> Result<(), ConfigError>
    where
        F: Fn(&FallbackContext, GateError<E>) -> Result<T, GateError<E>> + Send + Sync + 'static,
        T: 'static,
        E: 'static,
    {
        let gate = self
            .gates
            .get(key)
            .ok_or_else(|| ConfigError::UnregisteredGate(key.to_string()))?;
        gate.set_fallback(fallback);
        Ok(())
    }

    /// Metrics for every gate, sorted by name
    pub fn metrics(&self) -> Vec<GateMetrics> {
        let mut metrics: Vec<_> = self.gates.values().map(|gate| gate.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }
}
