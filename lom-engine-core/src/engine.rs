//! Dispatcher and main loop (§4.7, §4.8). Ties the transport, manager,
//! handlers, lock manager, timer set, and event publisher together. All
//! engine state is mutated from this single cooperative task; the transport
//! may multiplex I/O underneath, but only ever hands the loop one decoded
//! frame at a time (§5).

use crate::error::{EngineError, HandlerError, TransportError};
use crate::handler::{ChildOutcome, DetectionOutcome, LockAcquiredOutcome};
use crate::lock::{LockManager, LockOutcome};
use crate::manager::ActionManager;
use crate::message::{
    Message, Variant, KEY_ACTION_NAME, KEY_CLIENT_NAME, KEY_INSTANCE_ID, REQUEST_TYPE_SHUTDOWN,
};
use crate::publish::EventPublisher;
use crate::timer::TimerSet;
use crate::types::Timestamp;
use async_trait::async_trait;
use std::time::Duration;

/// Current wall-clock time as epoch seconds. The only place in the crate
/// that reaches for the clock directly, so tests can hold `now` fixed.
pub fn now_epoch() -> Timestamp {
    chrono::Utc::now().timestamp()
}

/// Transport boundary (§4.1). A concrete implementation (the FIFO transport
/// in the server crate, or an in-process fake in tests) multiplexes reads
/// across every registered client but only ever yields one frame per call.
#[async_trait]
pub trait Transport: Send {
    async fn init(&mut self, clients: &[String]) -> Result<(), TransportError>;

    /// Waits up to `timeout` for the next frame. `None` blocks indefinitely;
    /// `Some(Duration::ZERO)` polls once. Returns `Ok(None)` on a timeout.
    async fn read(&mut self, timeout: Option<Duration>) -> Result<Option<(String, Vec<u8>)>, TransportError>;

    async fn write(&mut self, client: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn deinit(&mut self) {}
}

/// Signals the loop acts on between iterations (§4.7 step 6).
#[derive(Debug, Default)]
pub struct LoopControl {
    pub reload_requested: bool,
    pub shutdown_requested: bool,
}

pub struct Engine<T: Transport, P: EventPublisher> {
    manager: ActionManager,
    lock: LockManager,
    timers: TimerSet,
    transport: T,
    publisher: P,
    last_heartbeat: Timestamp,
    heartbeat_since_last: Vec<String>,
}

impl<T: Transport, P: EventPublisher> Engine<T, P> {
    pub fn new(manager: ActionManager, transport: T, publisher: P) -> Self {
        Self {
            manager,
            lock: LockManager::new(),
            timers: TimerSet::new(),
            transport,
            publisher,
            last_heartbeat: 0,
            heartbeat_since_last: Vec::new(),
        }
    }

    pub fn manager(&self) -> &ActionManager {
        &self.manager
    }

    /// Runs the main loop until `control.shutdown_requested` is observed
    /// true by the caller between iterations, or a fatal error occurs.
    /// `poll_control` is consulted once per iteration so callers can wire
    /// OS signals (SIGHUP/SIGTERM) without the engine depending on them
    /// directly.
    pub async fn run(
        &mut self,
        mut poll_control: impl FnMut() -> LoopControl,
        mut reload_config: impl FnMut() -> Result<crate::types::Configuration, EngineError>,
    ) -> Result<(), EngineError> {
        self.publisher
            .init()
            .await
            .map_err(|e| EngineError::PublisherInit(e.to_string()))?;
        let clients: Vec<String> = self.manager.config().procs.clone();
        self.transport
            .init(&clients)
            .await
            .map_err(|e| EngineError::TransportInit(e.to_string()))?;

        loop {
            let control = poll_control();
            if control.shutdown_requested {
                break;
            }
            if control.reload_requested {
                self.manager.reload_config(reload_config()?);
            }

            let now = now_epoch();
            let heartbeat_interval = self.manager.config().globals.heartbeat_interval_seconds;
            let wait = self.next_wait(now, heartbeat_interval);

            match self.transport.read(wait).await {
                Ok(Some((client, payload))) => {
                    if let Err(err) = self.dispatch(now, &client, &payload).await {
                        tracing::warn!(client = %client, error = %err, "dispatch error");
                    }
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(error = %err, "transport read error"),
            }

            self.drain_pending_locks(now).await;
            self.fire_due_timers(now).await;
            self.maybe_publish_heartbeat(now, heartbeat_interval).await;
        }

        self.transport.deinit().await;
        self.publisher.deinit().await;
        Ok(())
    }

    fn next_wait(&self, now: Timestamp, heartbeat_interval: u64) -> Option<Duration> {
        let timer_wait = self.timers.next_wait(now);
        let heartbeat_wait = Duration::from_secs(
            heartbeat_interval.saturating_sub((now - self.last_heartbeat).max(0) as u64),
        );
        match timer_wait {
            Some(tw) => Some(tw.min(heartbeat_wait)),
            None => Some(heartbeat_wait),
        }
    }

    // ─── Dispatch (§4.8) ────────────────────────────────────────

    async fn dispatch(&mut self, now: Timestamp, client: &str, payload: &[u8]) -> Result<(), HandlerError> {
        let msg = Message::decode(payload)?;
        let client_name = msg.get(KEY_CLIENT_NAME).unwrap_or(client).to_string();

        match msg.variant {
            Variant::RegisterClient => {
                self.manager.register_client(&client_name, &mut self.timers)?;
            }
            Variant::DeregisterClient => {
                self.manager.deregister_client(&client_name, &mut self.timers);
            }
            Variant::RegisterAction => {
                let action_name = msg
                    .get(KEY_ACTION_NAME)
                    .ok_or(HandlerError::UnknownAction(String::new()))?
                    .to_string();
                let raised =
                    self.manager
                        .register_action(&client_name, &action_name, now, &mut self.timers)?;
                if let Some(req) = raised {
                    self.send(&client_name, req).await;
                }
            }
            Variant::Heartbeat => {
                let action_name = msg.get(KEY_ACTION_NAME).unwrap_or_default();
                let instance_id = msg.get(KEY_INSTANCE_ID).unwrap_or_default();
                if let Some(handler) = self.manager.handler_mut(action_name) {
                    handler.touch_heartbeat(now, instance_id);
                    self.heartbeat_since_last.push(action_name.to_string());
                }
            }
            Variant::ActionResponse => {
                let action_name = msg.get(KEY_ACTION_NAME).unwrap_or_default().to_string();
                self.handle_action_response(now, &action_name, &msg).await?;
            }
            Variant::Shutdown => {
                let action_name = msg.get(KEY_ACTION_NAME).unwrap_or_default();
                if let Some(handler) = self.manager.handler_mut(action_name) {
                    tracing::info!(action = %action_name, "shutdown requested for action");
                    handler.reset_to_idle(&mut self.timers);
                }
            }
        }
        Ok(())
    }

    async fn handle_action_response(
        &mut self,
        now: Timestamp,
        action_name: &str,
        msg: &Message,
    ) -> Result<(), HandlerError> {
        let is_anomaly = self
            .manager
            .handler(action_name)
            .map(|h| h.is_anomaly())
            .unwrap_or(false);

        if is_anomaly {
            let outcome = {
                let handler = self
                    .manager
                    .handler_mut(action_name)
                    .ok_or_else(|| HandlerError::UnknownAction(action_name.to_string()))?;
                handler.on_detection(&mut self.timers, msg)?
            };
            match outcome {
                DetectionOutcome::ReRaise { publish } => {
                    self.publisher.publish(publish).await;
                    let req = self
                        .manager
                        .self_raise_anomaly(action_name, now, &mut self.timers)?;
                    let client = self.manager.handler(action_name).map(|h| h.client_name.clone());
                    if let Some(client) = client {
                        self.send(&client, req).await;
                    }
                }
                DetectionOutcome::LockPending { publish } => {
                    self.publisher.publish(publish).await;
                    self.attempt_mitigation_lock(now, action_name).await?;
                }
            }
            return Ok(());
        }

        let (publish, notify_anomaly) = {
            let handler = self
                .manager
                .handler_mut(action_name)
                .ok_or_else(|| HandlerError::UnknownAction(action_name.to_string()))?;
            let outcome = handler.process_response(&mut self.timers, msg);
            (outcome.publish, outcome.notify_anomaly)
        };
        self.publisher.publish(publish).await;
        if let Some((anomaly_instance_id, child_action)) = notify_anomaly {
            self.route_child_response(now, &anomaly_instance_id, &child_action, msg)
                .await?;
        }
        Ok(())
    }

    async fn attempt_mitigation_lock(&mut self, now: Timestamp, action_name: &str) -> Result<(), HandlerError> {
        let mitigation_timeout = self
            .manager
            .handler(action_name)
            .map(|h| h.config.effective_mitigation_timeout())
            .unwrap_or(crate::types::DEFAULT_MITIGATION_TIMEOUT_SECONDS);
        let deadline = now + mitigation_timeout as i64;

        match self.lock.acquire(action_name, deadline) {
            LockOutcome::Queued => {
                let handler = self
                    .manager
                    .handler_mut(action_name)
                    .ok_or_else(|| HandlerError::UnknownAction(action_name.to_string()))?;
                let publish = handler.on_lock_queued();
                self.publisher.publish(publish).await;
            }
            LockOutcome::Acquired => {
                let plan = self.manager.compute_plan(action_name);
                let outcome = {
                    let handler = self
                        .manager
                        .handler_mut(action_name)
                        .ok_or_else(|| HandlerError::UnknownAction(action_name.to_string()))?;
                    handler.on_lock_acquired(now, &mut self.timers, plan, mitigation_timeout)?
                };
                match outcome {
                    LockAcquiredOutcome::Empty { publish, next_request } => {
                        self.lock.release(action_name);
                        self.publisher.publish(publish).await;
                        self.manager.refresh_instance_index(action_name);
                        let client = self.manager.handler(action_name).map(|h| h.client_name.clone());
                        if let Some(client) = client {
                            self.send(&client, next_request).await;
                        }
                    }
                    LockAcquiredOutcome::Started {
                        first_action,
                        anomaly_instance_id,
                        anomaly_key,
                        context_json,
                    } => {
                        self.raise_plan_element(
                            now,
                            action_name,
                            &first_action,
                            &anomaly_instance_id,
                            &anomaly_key,
                            &context_json,
                            0,
                        )
                        .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn route_child_response(
        &mut self,
        now: Timestamp,
        anomaly_instance_id: &str,
        child_action: &str,
        msg: &Message,
    ) -> Result<(), HandlerError> {
        let Some(anomaly_action) = self
            .manager
            .anomaly_action_for_instance(anomaly_instance_id)
            .map(String::from)
        else {
            return Ok(());
        };

        let configs = self.manager.config().actions.clone();
        let outcome = {
            let handler = self
                .manager
                .handler_mut(&anomaly_action)
                .ok_or_else(|| HandlerError::UnknownAction(anomaly_action.clone()))?;
            handler.on_child_response(now, &mut self.lock, &mut self.timers, child_action, msg, &configs)?
        };

        match outcome {
            ChildOutcome::NextAction {
                action_name,
                context_json,
                last_result_code,
            } => {
                let (anomaly_instance_id, anomaly_key) = {
                    let anomaly = self
                        .manager
                        .handler(&anomaly_action)
                        .ok_or_else(|| HandlerError::UnknownAction(anomaly_action.clone()))?;
                    (
                        anomaly.current_instance_id().unwrap_or_default().to_string(),
                        anomaly.anomaly_key().to_string(),
                    )
                };
                self.raise_plan_element(
                    now,
                    &anomaly_action,
                    &action_name,
                    &anomaly_instance_id,
                    &anomaly_key,
                    &context_json,
                    last_result_code,
                )
                .await?;
            }
            ChildOutcome::SequenceDone { publish, next_request } => {
                if !publish.is_null() {
                    self.publisher.publish(publish).await;
                }
                self.manager.refresh_instance_index(&anomaly_action);
                let client = self.manager.handler(&anomaly_action).map(|h| h.client_name.clone());
                if let Some(client) = client {
                    self.send(&client, next_request).await;
                }
            }
        }
        Ok(())
    }

    /// Raises `child_action` as the current plan element, advancing through
    /// any further elements in-loop (no client round-trip involved) whenever
    /// one refuses to run outright, instead of aborting the whole mitigation
    /// (§4.6.1, §8 recurrence/skip scenario).
    #[allow(clippy::too_many_arguments)]
    async fn raise_plan_element(
        &mut self,
        now: Timestamp,
        anomaly_action: &str,
        child_action: &str,
        anomaly_instance_id: &str,
        anomaly_key: &str,
        context_json: &str,
        last_result_code: i32,
    ) -> Result<(), HandlerError> {
        let mut child_action = child_action.to_string();
        let mut anomaly_instance_id = anomaly_instance_id.to_string();
        let mut anomaly_key = anomaly_key.to_string();
        let mut context_json = context_json.to_string();
        let mut last_result_code = last_result_code;

        loop {
            let raised = {
                let child = self
                    .manager
                    .handler_mut(&child_action)
                    .ok_or_else(|| HandlerError::UnknownAction(child_action.clone()))?;
                child.raise_request(
                    now,
                    &mut self.timers,
                    anomaly_action,
                    &anomaly_instance_id,
                    &anomaly_key,
                    &context_json,
                    last_result_code,
                )
            };

            let refusal = match raised {
                Ok(req) => {
                    let client = self
                        .manager
                        .handler(&child_action)
                        .map(|h| h.client_name.clone())
                        .unwrap_or_default();
                    self.send(&client, req).await;
                    return Ok(());
                }
                Err(err @ (HandlerError::RecurrenceSuppressed(_) | HandlerError::MandatoryPrecondition(_))) => err,
                Err(err) => return Err(err),
            };

            let (result_code, result_text) = plan_element_skip_reason(&refusal);
            tracing::warn!(action = %child_action, error = %refusal, "plan element refused to run, skipping it");

            let configs = self.manager.config().actions.clone();
            let outcome = {
                let handler = self
                    .manager
                    .handler_mut(anomaly_action)
                    .ok_or_else(|| HandlerError::UnknownAction(anomaly_action.to_string()))?;
                handler.fail_plan_element(
                    now,
                    &mut self.lock,
                    &mut self.timers,
                    &child_action,
                    result_code,
                    &result_text,
                    &configs,
                )?
            };

            match outcome {
                ChildOutcome::NextAction {
                    action_name,
                    context_json: next_context,
                    last_result_code: next_code,
                } => {
                    let anomaly = self
                        .manager
                        .handler(anomaly_action)
                        .ok_or_else(|| HandlerError::UnknownAction(anomaly_action.to_string()))?;
                    anomaly_instance_id = anomaly.current_instance_id().unwrap_or_default().to_string();
                    anomaly_key = anomaly.anomaly_key().to_string();
                    child_action = action_name;
                    context_json = next_context;
                    last_result_code = next_code;
                }
                ChildOutcome::SequenceDone { publish, next_request } => {
                    if !publish.is_null() {
                        self.publisher.publish(publish).await;
                    }
                    self.manager.refresh_instance_index(anomaly_action);
                    let client = self.manager.handler(anomaly_action).map(|h| h.client_name.clone());
                    if let Some(client) = client {
                        self.send(&client, next_request).await;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn send(&mut self, client: &str, msg: Message) {
        match msg.encode() {
            Ok(bytes) => {
                if let Err(err) = self.transport.write(client, bytes).await {
                    tracing::warn!(client = %client, error = %err, "transport write error");
                }
            }
            Err(err) => tracing::warn!(client = %client, error = %err, "failed to encode outbound message"),
        }
    }

    /// Drains the lock's pending queue (§4.4, §4.6.3): once the current
    /// holder releases, the next queued anomaly resumes without waiting for
    /// another client round-trip.
    async fn drain_pending_locks(&mut self, now: Timestamp) {
        while !self.lock.is_held() {
            let Some(next) = self.lock.peek_pending() else { break };
            if let Err(err) = self.attempt_mitigation_lock(now, &next).await {
                tracing::warn!(action = %next, error = %err, "failed to resume queued mitigation");
                self.lock.cancel_pending(&next);
            }
        }
    }

    /// Fires every timer whose deadline has passed (§4.3, §4.5, §4.6).
    async fn fire_due_timers(&mut self, now: Timestamp) {
        for action_name in self.timers.fire_due(now) {
            let is_mitigating = self
                .manager
                .handler(&action_name)
                .map(|h| h.is_anomaly() && matches!(h.state, crate::types::ActionState::Mitigating))
                .unwrap_or(false);

            if is_mitigating {
                let publish = self
                    .manager
                    .handler_mut(&action_name)
                    .and_then(|h| h.check_mitigation_timeout(&mut self.timers));
                if let Some(publish) = publish {
                    self.publisher.publish(publish).await;
                }
                continue;
            }

            let outcome = self
                .manager
                .handler_mut(&action_name)
                .and_then(|h| h.check_timeout(now, &mut self.timers));
            if let Some(outcome) = outcome {
                let synthetic = Message::from_json(&outcome.publish).ok();
                self.publisher.publish(outcome.publish).await;
                if let (Some((anomaly_instance_id, child_action)), Some(synthetic)) =
                    (outcome.notify_anomaly, synthetic)
                {
                    if let Err(err) = self
                        .route_child_response(now, &anomaly_instance_id, &child_action, &synthetic)
                        .await
                    {
                        tracing::warn!(action = %child_action, error = %err, "timeout routing error");
                    }
                }
            }
        }
    }

    async fn maybe_publish_heartbeat(&mut self, now: Timestamp, heartbeat_interval: u64) {
        if now - self.last_heartbeat < heartbeat_interval as i64 {
            return;
        }
        let actions = std::mem::take(&mut self.heartbeat_since_last);
        self.publisher
            .publish(serde_json::json!({ "heartbeat": { "timestamp": now, "actions": actions } }))
            .await;
        self.last_heartbeat = now;
    }
}

/// A message carrying `request_type = shutdown`, used by the client-library
/// helper and integration tests to exercise the shutdown flow end to end.
pub fn is_shutdown_request(msg: &Message) -> bool {
    msg.get("request_type") == Some(REQUEST_TYPE_SHUTDOWN)
}

/// Maps a refused plan-element raise to the result code/text
/// [`crate::handler::Handler::fail_plan_element`] stamps onto the skipped
/// step. Only called for the two `HandlerError` variants `raise_request` can
/// return for reasons intrinsic to the action itself, not the engine.
fn plan_element_skip_reason(cause: &HandlerError) -> (i32, String) {
    match cause {
        HandlerError::RecurrenceSuppressed(name) => (
            crate::types::ERR_RECURRENCE_SUPPRESSED,
            format!("{name} skipped: inside its recurrence window"),
        ),
        HandlerError::MandatoryPrecondition(name) => (
            crate::types::ERR_PRECONDITION_REFUSED,
            format!("{name} skipped: prior failure and action is not mandatory"),
        ),
        other => unreachable!("plan_element_skip_reason called for {other:?}"),
    }
}
