//! Per-action state machine (§4.5) and its anomaly-sequencer extension
//! (§4.6). A handler is either a plain action or an anomaly action; the
//! distinction is carried as an optional `Sequencer` sub-object rather than
//! through inheritance or a back-pointer to the owning manager, so a handler
//! never needs to know who raised it.

use crate::error::HandlerError;
use crate::message::{
    Message, Variant, KEY_ACTION_DATA, KEY_ACTION_NAME, KEY_ANOMALY_INSTANCE_ID, KEY_ANOMALY_KEY,
    KEY_CLIENT_NAME, KEY_CONTEXT, KEY_HEARTBEAT_INTERVAL, KEY_INSTANCE_ID, KEY_REQUEST_TYPE,
    KEY_RESULT_CODE, KEY_RESULT_STR, KEY_TIMEOUT, REQUEST_TYPE_ACTION,
};
use crate::timer::TimerSet;
use crate::types::{ActionConfig, ActionState, ActionsConfig, Timestamp, ETIMEDOUT};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use uuid::Uuid;

/// What the caller should do with an action handler's raw response.
pub struct ProcessOutcome {
    /// Always published, whether or not the response advanced the handler.
    pub publish: Json,
    /// Set when the response was accepted: the owning anomaly's instance id
    /// and the child action name, for the caller to route to that anomaly's
    /// `on_child_response`.
    pub notify_anomaly: Option<(String, String)>,
}

/// Outcome of processing an anomaly's own detection response.
pub enum DetectionOutcome {
    /// Detection was rejected (mismatched instance id or nonzero result);
    /// the handler already reset and the caller should re-raise it.
    ReRaise { publish: Json },
    /// Detection succeeded; the handler is now `LOCK_PENDING` and the caller
    /// should attempt to acquire the mitigation lock on its behalf.
    LockPending { publish: Json },
}

/// Outcome of attempting to acquire the mitigation lock once `LOCK_PENDING`.
pub enum LockAcquiredOutcome {
    /// The binding plan was empty (unresolved or disabled action); the
    /// mitigation is already finished and the lock already released.
    Empty { publish: Json, next_request: Message },
    /// The first plan element should now be raised on its own handler.
    Started {
        first_action: String,
        anomaly_instance_id: String,
        anomaly_key: String,
        context_json: String,
    },
}

/// Outcome of a child action's response arriving during mitigation.
pub enum ChildOutcome {
    /// Advance to the next plan element.
    NextAction {
        action_name: String,
        context_json: String,
        last_result_code: i32,
    },
    /// The plan is exhausted; lock already released, handler already reset
    /// and re-raised.
    SequenceDone { publish: Json, next_request: Message },
}

#[derive(Debug, Default)]
struct Sequencer {
    anomaly_name: String,
    anomaly_key: String,
    plan: Vec<String>,
    plan_index: usize,
    context: BTreeMap<String, Json>,
    mitigation_failed: bool,
    mitigation_done_published: bool,
    failure_code: i32,
    failure_text: String,
    anomaly_resp: Option<Message>,
    mitigation_deadline: Timestamp,
}

impl Sequencer {
    fn new(anomaly_name: &str) -> Self {
        Self {
            anomaly_name: anomaly_name.to_string(),
            ..Default::default()
        }
    }

    fn reset(&mut self) {
        let anomaly_name = std::mem::take(&mut self.anomaly_name);
        *self = Sequencer::new(&anomaly_name);
    }
}

/// One action's state machine, with an optional mitigation sequencer when
/// the action is an anomaly trigger.
#[derive(Debug)]
pub struct Handler {
    pub client_name: String,
    pub action_name: String,
    pub config: ActionConfig,
    pub state: ActionState,
    current_instance_id: Option<String>,
    current_anomaly_instance_id: String,
    current_anomaly_key: String,
    deadline: Timestamp,
    last_heartbeat: Timestamp,
    last_result_code: i32,
    recurrence: BTreeMap<(String, String), Timestamp>,
    sequencer: Option<Sequencer>,
}

impl Handler {
    pub fn new(client_name: impl Into<String>, action_name: impl Into<String>, config: ActionConfig) -> Self {
        Self {
            client_name: client_name.into(),
            action_name: action_name.into(),
            config,
            state: ActionState::None,
            current_instance_id: None,
            current_anomaly_instance_id: String::new(),
            current_anomaly_key: String::new(),
            deadline: 0,
            last_heartbeat: 0,
            last_result_code: 0,
            recurrence: BTreeMap::new(),
            sequencer: None,
        }
    }

    pub fn new_anomaly(
        client_name: impl Into<String>,
        action_name: impl Into<String>,
        config: ActionConfig,
    ) -> Self {
        let action_name = action_name.into();
        let mut handler = Self::new(client_name, action_name.clone(), config);
        handler.sequencer = Some(Sequencer::new(&action_name));
        handler
    }

    pub fn is_anomaly(&self) -> bool {
        self.sequencer.is_some()
    }

    pub fn current_instance_id(&self) -> Option<&str> {
        self.current_instance_id.as_deref()
    }

    fn prune_recurrence(&mut self, now: Timestamp, window: u64) {
        if window == 0 {
            return;
        }
        self.recurrence
            .retain(|_, last| now - *last < window as i64);
    }

    /// Raises a fresh request on this (non-anomaly) handler. Used both for
    /// externally-driven detections and for each element of a mitigation
    /// plan.
    pub fn raise_request(
        &mut self,
        now: Timestamp,
        timers: &mut TimerSet,
        anomaly_name: &str,
        anomaly_instance_id: &str,
        anomaly_key: &str,
        context_json: &str,
        last_result_code: i32,
    ) -> Result<Message, HandlerError> {
        if self.is_anomaly() {
            return Err(HandlerError::AnomalySelfRaiseOnly(self.action_name.clone()));
        }
        if self.state != ActionState::None {
            return Err(HandlerError::NotIdle(self.action_name.clone()));
        }
        if last_result_code != 0 && !self.config.is_mandatory() {
            return Err(HandlerError::MandatoryPrecondition(self.action_name.clone()));
        }
        let window = self.config.recurrence_window();
        self.prune_recurrence(now, window);
        let key = (anomaly_name.to_string(), anomaly_key.to_string());
        if window > 0 {
            if let Some(last) = self.recurrence.get(&key) {
                if now - *last < window as i64 {
                    return Err(HandlerError::RecurrenceSuppressed(self.action_name.clone()));
                }
            }
        }

        let instance_id = Uuid::new_v4().to_string();
        let timeout = self.config.effective_timeout();

        let mut msg = Message::new(Variant::ActionRequest);
        msg.set(KEY_CLIENT_NAME, self.client_name.clone())?;
        msg.set(KEY_ACTION_NAME, self.action_name.clone())?;
        msg.set(KEY_REQUEST_TYPE, REQUEST_TYPE_ACTION)?;
        msg.set(KEY_INSTANCE_ID, instance_id.clone())?;
        msg.set(KEY_ANOMALY_INSTANCE_ID, anomaly_instance_id)?;
        if !anomaly_key.is_empty() {
            msg.set(KEY_ANOMALY_KEY, anomaly_key)?;
        }
        if !context_json.is_empty() {
            msg.set(KEY_CONTEXT, context_json)?;
        }
        msg.set(KEY_TIMEOUT, timeout.to_string())?;
        if let Some(interval) = self.config.heartbeat_interval_seconds {
            msg.set(KEY_HEARTBEAT_INTERVAL, interval.to_string())?;
        }
        msg.validate()?;

        let deadline = now + timeout as i64;
        self.state = ActionState::Active;
        self.current_instance_id = Some(instance_id);
        self.current_anomaly_instance_id = anomaly_instance_id.to_string();
        self.current_anomaly_key = anomaly_key.to_string();
        self.deadline = deadline;
        self.last_result_code = last_result_code;
        self.recurrence.insert(key, now);
        timers.register_at(&self.action_name, deadline);
        Ok(msg)
    }

    /// Self-raises an anomaly's own detection request. `timeout = 0` means
    /// no per-request timer is registered for it (§4.6).
    pub fn self_raise(&mut self, now: Timestamp, timers: &mut TimerSet) -> Result<Message, HandlerError> {
        if !self.is_anomaly() {
            return Err(HandlerError::UnknownAction(self.action_name.clone()));
        }
        if self.state != ActionState::None {
            return Err(HandlerError::NotIdle(self.action_name.clone()));
        }
        timers.deregister(&self.action_name);
        let instance_id = Uuid::new_v4().to_string();

        let mut msg = Message::new(Variant::ActionRequest);
        msg.set(KEY_CLIENT_NAME, self.client_name.clone())?;
        msg.set(KEY_ACTION_NAME, self.action_name.clone())?;
        msg.set(KEY_REQUEST_TYPE, REQUEST_TYPE_ACTION)?;
        msg.set(KEY_INSTANCE_ID, instance_id.clone())?;
        msg.set(KEY_ANOMALY_INSTANCE_ID, "")?;
        msg.validate()?;

        self.state = ActionState::Active;
        self.current_instance_id = Some(instance_id);
        self.current_anomaly_instance_id.clear();
        self.current_anomaly_key.clear();
        self.deadline = 0;
        if let Some(seq) = &mut self.sequencer {
            seq.reset();
        }
        Ok(msg)
    }

    /// Non-anomaly response handling (§4.5). Always publishes; advances
    /// state and reports a notification target only when the response
    /// matches the outstanding request.
    pub fn process_response(&mut self, timers: &mut TimerSet, msg: &Message) -> ProcessOutcome {
        let publish = msg.to_json();
        let matches = self.state == ActionState::Active
            && msg.get(KEY_INSTANCE_ID) == self.current_instance_id.as_deref();
        let notify_anomaly = if matches {
            let target = (self.current_anomaly_instance_id.clone(), self.action_name.clone());
            self.reset_to_idle(timers);
            Some(target)
        } else {
            None
        };
        ProcessOutcome { publish, notify_anomaly }
    }

    /// Per-request timeout (§4.5). Returns `None` if the handler was no
    /// longer waiting (already reset by a real response) or the deadline
    /// hasn't actually passed, in which case the timer is re-registered.
    pub fn check_timeout(&mut self, now: Timestamp, timers: &mut TimerSet) -> Option<ProcessOutcome> {
        if !matches!(self.state, ActionState::Active | ActionState::TimedOut) {
            return None;
        }
        if now < self.deadline {
            timers.register_at(&self.action_name, self.deadline);
            return None;
        }
        let mut msg = Message::new(Variant::ActionResponse);
        let _ = msg.set(KEY_CLIENT_NAME, self.client_name.clone());
        let _ = msg.set(KEY_ACTION_NAME, self.action_name.clone());
        let _ = msg.set(KEY_REQUEST_TYPE, REQUEST_TYPE_ACTION);
        let _ = msg.set(
            KEY_INSTANCE_ID,
            self.current_instance_id.clone().unwrap_or_default(),
        );
        let _ = msg.set(KEY_ANOMALY_INSTANCE_ID, self.current_anomaly_instance_id.clone());
        if !self.current_anomaly_key.is_empty() {
            let _ = msg.set(KEY_ANOMALY_KEY, self.current_anomaly_key.clone());
        }
        let _ = msg.set(KEY_ACTION_DATA, "");
        let _ = msg.set(KEY_RESULT_CODE, ETIMEDOUT.to_string());
        let _ = msg.set(KEY_RESULT_STR, "Action timedout");

        let publish = msg.to_json();
        let notify_anomaly = Some((self.current_anomaly_instance_id.clone(), self.action_name.clone()));
        self.reset_to_idle(timers);
        Some(ProcessOutcome { publish, notify_anomaly })
    }

    pub fn reset_to_idle(&mut self, timers: &mut TimerSet) {
        self.state = ActionState::None;
        timers.deregister(&self.action_name);
        self.current_instance_id = None;
        self.current_anomaly_instance_id.clear();
        self.current_anomaly_key.clear();
        self.deadline = 0;
    }

    pub fn touch_heartbeat(&mut self, now: Timestamp, instance_id: &str) -> bool {
        if self.current_instance_id.as_deref() == Some(instance_id) {
            self.last_heartbeat = now;
            true
        } else {
            false
        }
    }

    pub fn last_heartbeat(&self) -> Timestamp {
        self.last_heartbeat
    }

    // ─── Anomaly sequencer operations ───────────────────────────

    fn seq_mut(&mut self) -> &mut Sequencer {
        self.sequencer.as_mut().expect("not an anomaly handler")
    }

    /// Processes the anomaly's own detection response (§4.6 "On detection").
    pub fn on_detection(
        &mut self,
        timers: &mut TimerSet,
        msg: &Message,
    ) -> Result<DetectionOutcome, HandlerError> {
        let publish = msg.to_json();
        let instance_matches = msg.get(KEY_INSTANCE_ID) == self.current_instance_id.as_deref();
        let detected = msg
            .get(KEY_RESULT_CODE)
            .and_then(|v| v.parse::<i32>().ok())
            .map(|code| code == 0)
            .unwrap_or(false);

        if !instance_matches || !detected {
            self.reset_to_idle(timers);
            return Ok(DetectionOutcome::ReRaise { publish });
        }

        let anomaly_key = msg.get(KEY_ANOMALY_KEY).unwrap_or("").to_string();
        let action_data = msg.get(KEY_ACTION_DATA).unwrap_or("").to_string();
        let action_name = self.action_name.clone();

        let seq = self.seq_mut();
        seq.anomaly_key = anomaly_key;
        seq.context = BTreeMap::new();
        seq.context.insert(action_name, Json::String(action_data));
        seq.anomaly_resp = Some(msg.clone());
        self.state = ActionState::LockPending;
        Ok(DetectionOutcome::LockPending { publish })
    }

    pub fn anomaly_key(&self) -> &str {
        self.sequencer.as_ref().map(|s| s.anomaly_key.as_str()).unwrap_or("")
    }

    /// Republishes the cached detection response with `mitigation_state =
    /// PENDING` while queued behind another mitigation.
    pub fn on_lock_queued(&mut self) -> Json {
        let seq = self.seq_mut();
        let resp = seq.anomaly_resp.clone().unwrap_or_else(|| Message::new(Variant::ActionResponse));
        with_mitigation_state(&resp, "PENDING", None)
    }

    /// Begins mitigation once the lock is held, or finishes immediately with
    /// an error if the plan could not be resolved (§4.6.1).
    pub fn on_lock_acquired(
        &mut self,
        now: Timestamp,
        timers: &mut TimerSet,
        plan: Vec<String>,
        mitigation_timeout: u64,
    ) -> Result<LockAcquiredOutcome, HandlerError> {
        if plan.is_empty() {
            let seq = self.seq_mut();
            let resp = seq.anomaly_resp.clone().unwrap_or_else(|| Message::new(Variant::ActionResponse));
            let publish = with_mitigation_state(
                &resp,
                "DONE",
                Some((crate::types::ERR_NO_PLAN, "no resolvable mitigation plan")),
            );
            self.reset_to_idle(timers);
            let next_request = self.self_raise(now, timers)?;
            return Ok(LockAcquiredOutcome::Empty { publish, next_request });
        }

        let anomaly_instance_id = self.current_instance_id.clone().unwrap_or_default();
        let anomaly_key = self.anomaly_key().to_string();
        let first_action = plan[0].clone();
        let context_json = {
            let seq = self.seq_mut();
            seq.plan = plan;
            seq.plan_index = 0;
            seq.mitigation_failed = false;
            seq.mitigation_done_published = false;
            seq.mitigation_deadline = now + mitigation_timeout as i64;
            serde_json::to_string(&seq.context).unwrap_or_default()
        };
        self.state = ActionState::Mitigating;
        timers.register_at(&self.action_name, self.seq_mut().mitigation_deadline);

        Ok(LockAcquiredOutcome::Started {
            first_action,
            anomaly_instance_id,
            anomaly_key,
            context_json,
        })
    }

    /// A mitigation-timeout fire while `MITIGATING`. Marks the run failed
    /// and publishes DONE at most once; does not reset state, since an
    /// outstanding child response must still converge (§4.6).
    pub fn check_mitigation_timeout(&mut self, timers: &mut TimerSet) -> Option<Json> {
        if self.state != ActionState::Mitigating {
            return None;
        }
        let seq = self.seq_mut();
        seq.mitigation_failed = true;
        if seq.mitigation_done_published {
            return None;
        }
        seq.mitigation_done_published = true;
        let resp = seq.anomaly_resp.clone().unwrap_or_else(|| Message::new(Variant::ActionResponse));
        timers.deregister(&self.action_name);
        Some(with_mitigation_state(&resp, "DONE", Some((ETIMEDOUT, "Timed out waiting for mitigation"))))
    }

    /// A child action's response during mitigation (§4.6 `on_child_response`).
    pub fn on_child_response(
        &mut self,
        now: Timestamp,
        lock: &mut crate::lock::LockManager,
        timers: &mut TimerSet,
        action_name: &str,
        msg: &Message,
        configs: &ActionsConfig,
    ) -> Result<ChildOutcome, HandlerError> {
        if lock.holder() != Some(self.action_name.as_str()) {
            return Err(HandlerError::LockNotHeld(self.action_name.clone()));
        }
        if self.state != ActionState::Mitigating {
            return Err(HandlerError::StalePlanElement(action_name.to_string()));
        }
        {
            let seq = self.sequencer.as_ref().expect("anomaly handler");
            let expected = seq.plan.get(seq.plan_index).map(String::as_str);
            if expected != Some(action_name) {
                return Err(HandlerError::StalePlanElement(action_name.to_string()));
            }
            let msg_key = msg.get(KEY_ANOMALY_KEY).unwrap_or("");
            if msg_key != seq.anomaly_key {
                return Err(HandlerError::AnomalyKeyMismatch(
                    action_name.to_string(),
                    msg_key.to_string(),
                    seq.anomaly_key.clone(),
                ));
            }
        }

        let result_code: i32 = msg.get(KEY_RESULT_CODE).and_then(|v| v.parse().ok()).unwrap_or(0);
        let action_data = msg.get(KEY_ACTION_DATA).unwrap_or("").to_string();
        let result_text = msg.get(KEY_RESULT_STR).unwrap_or("mitigation action failed").to_string();

        match self.advance_plan(action_name, result_code, &result_text, Some(&action_data), configs) {
            PlanAdvance::Continue { action_name, context_json, last_result_code } => {
                Ok(ChildOutcome::NextAction { action_name, context_json, last_result_code })
            }
            PlanAdvance::Done { publish } => {
                lock.release(&self.action_name);
                self.reset_to_idle(timers);
                let next_request = self.self_raise(now, timers)?;
                Ok(ChildOutcome::SequenceDone { publish, next_request })
            }
        }
    }

    /// A plan element refused to run at all (its own recurrence window or
    /// mandatory-precondition check rejected the raise, so no request ever
    /// reached its client). Records it as a failed step using the given
    /// result code/text and advances the plan exactly as a real response
    /// would, instead of leaving the mitigation stuck holding the lock
    /// forever (§4.6.1, §8 recurrence/skip scenario).
    pub fn fail_plan_element(
        &mut self,
        now: Timestamp,
        lock: &mut crate::lock::LockManager,
        timers: &mut TimerSet,
        action_name: &str,
        result_code: i32,
        result_text: &str,
        configs: &ActionsConfig,
    ) -> Result<ChildOutcome, HandlerError> {
        if lock.holder() != Some(self.action_name.as_str()) {
            return Err(HandlerError::LockNotHeld(self.action_name.clone()));
        }
        if self.state != ActionState::Mitigating {
            return Err(HandlerError::StalePlanElement(action_name.to_string()));
        }
        {
            let seq = self.sequencer.as_ref().expect("anomaly handler");
            let expected = seq.plan.get(seq.plan_index).map(String::as_str);
            if expected != Some(action_name) {
                return Err(HandlerError::StalePlanElement(action_name.to_string()));
            }
        }

        match self.advance_plan(action_name, result_code, result_text, None, configs) {
            PlanAdvance::Continue { action_name, context_json, last_result_code } => {
                Ok(ChildOutcome::NextAction { action_name, context_json, last_result_code })
            }
            PlanAdvance::Done { publish } => {
                lock.release(&self.action_name);
                self.reset_to_idle(timers);
                let next_request = self.self_raise(now, timers)?;
                Ok(ChildOutcome::SequenceDone { publish, next_request })
            }
        }
    }

    /// Shared by [`Handler::on_child_response`] and
    /// [`Handler::fail_plan_element`]: records the outcome of the current
    /// plan element, marks the run failed on a first nonzero code, then skips
    /// forward past any following non-mandatory elements once failed.
    fn advance_plan(
        &mut self,
        action_name: &str,
        result_code: i32,
        result_text: &str,
        action_data: Option<&str>,
        configs: &ActionsConfig,
    ) -> PlanAdvance {
        let seq = self.seq_mut();
        if let Some(data) = action_data {
            seq.context.insert(action_name.to_string(), Json::String(data.to_string()));
        }
        if result_code != 0 && !seq.mitigation_failed {
            seq.mitigation_failed = true;
            seq.failure_code = result_code;
            seq.failure_text = result_text.to_string();
        }

        seq.plan_index += 1;
        if seq.mitigation_failed {
            while seq.plan_index < seq.plan.len() {
                let next = &seq.plan[seq.plan_index];
                let mandatory = configs.get(next).map(|c| c.is_mandatory()).unwrap_or(false);
                if mandatory {
                    break;
                }
                seq.plan_index += 1;
            }
        }

        if seq.plan_index < seq.plan.len() {
            let next_action = seq.plan[seq.plan_index].clone();
            let context_json = serde_json::to_string(&seq.context).unwrap_or_default();
            let last_result_code = if seq.mitigation_failed { seq.failure_code } else { 0 };
            return PlanAdvance::Continue {
                action_name: next_action,
                context_json,
                last_result_code,
            };
        }

        let failed = seq.mitigation_failed;
        let (code, text) = if failed {
            (seq.failure_code, seq.failure_text.clone())
        } else {
            (0, "mitigation complete".to_string())
        };
        let resp = seq.anomaly_resp.clone().unwrap_or_else(|| Message::new(Variant::ActionResponse));
        let already_published = seq.mitigation_done_published;
        seq.mitigation_done_published = true;

        let publish = if already_published {
            Json::Null
        } else {
            with_mitigation_state(&resp, "DONE", Some((code, &text)))
        };
        PlanAdvance::Done { publish }
    }
}

/// Internal result of [`Handler::advance_plan`], lifted into a
/// [`ChildOutcome`] (with the lock/reset/re-raise side effects applied) by
/// each caller.
enum PlanAdvance {
    Continue {
        action_name: String,
        context_json: String,
        last_result_code: i32,
    },
    Done {
        publish: Json,
    },
}

/// Clones `msg`'s published JSON and layers `mitigation_state` (and,
/// optionally, an overriding result code/string) into the variant body.
fn with_mitigation_state(msg: &Message, state: &str, result: Option<(i32, &str)>) -> Json {
    let mut json = msg.to_json();
    if let Json::Object(obj) = &mut json {
        if let Some((_, body)) = obj.iter_mut().next() {
            if let Json::Object(body) = body {
                body.insert("mitigation_state".to_string(), Json::String(state.to_string()));
                if let Some((code, text)) = result {
                    body.insert(KEY_RESULT_CODE.to_string(), Json::String(code.to_string()));
                    body.insert(KEY_RESULT_STR.to_string(), Json::String(text.to_string()));
                }
            }
        }
    }
    json
}
