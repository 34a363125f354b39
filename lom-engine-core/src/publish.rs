//! Trait boundary for the external event sink (§2, §6). The engine never
//! talks to a real syslog/event-bus client directly; it publishes through
//! this trait, with a `tracing`-backed default standing in for one.

use async_trait::async_trait;
use serde_json::Value as Json;

/// An external event sink. Implementations are responsible for their own
/// buffering and backpressure; `publish` is expected not to block the main
/// loop for long.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish(&self, event: Json);

    async fn deinit(&mut self) {}
}

/// Default publisher: emits each event as a structured `tracing::info!`.
/// Stands in for a real event-bus client (explicitly out of scope, §1).
#[derive(Debug, Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event: Json) {
        if event.is_null() {
            return;
        }
        tracing::info!(event = %event, "publish");
    }
}
