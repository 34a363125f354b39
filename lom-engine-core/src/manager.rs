//! Manager registries (§2, §4.8): client ↔ action ownership and the
//! action → handler map. Orchestration here stays to plain data lookups —
//! borrows of two different map entries are taken sequentially, never
//! simultaneously, so the borrow checker never needs a back-pointer from a
//! handler to its owner.

use crate::error::HandlerError;
use crate::handler::Handler;
use crate::timer::TimerSet;
use crate::types::{Configuration, Timestamp};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct ActionManager {
    config: Configuration,
    /// client_name -> owned action names, in registration order.
    clients: BTreeMap<String, Vec<String>>,
    /// action_name -> handler.
    handlers: BTreeMap<String, Handler>,
    /// anomaly_instance_id -> owning anomaly action name, live for the
    /// lifetime of one detection/mitigation cycle.
    active_mitigations: BTreeMap<String, String>,
}

impl ActionManager {
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            clients: BTreeMap::new(),
            handlers: BTreeMap::new(),
            active_mitigations: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn reload_config(&mut self, config: Configuration) {
        self.config = config;
    }

    pub fn is_client_allowed(&self, client_name: &str) -> bool {
        self.config.procs.iter().any(|p| p == client_name)
    }

    pub fn is_client_registered(&self, client_name: &str) -> bool {
        self.clients.contains_key(client_name)
    }

    /// Registers `client_name`. Re-registration under the same name resets
    /// its prior state (§3: "Client" lifecycle).
    pub fn register_client(&mut self, client_name: &str, timers: &mut TimerSet) -> Result<(), HandlerError> {
        if !self.is_client_allowed(client_name) {
            return Err(HandlerError::UnknownClient(client_name.to_string()));
        }
        self.deregister_client(client_name, timers);
        self.clients.insert(client_name.to_string(), Vec::new());
        Ok(())
    }

    /// Drops every action owned by `client_name` and removes the client
    /// entry. A no-op if the client wasn't registered.
    pub fn deregister_client(&mut self, client_name: &str, timers: &mut TimerSet) {
        if let Some(actions) = self.clients.remove(client_name) {
            for action in actions {
                self.handlers.remove(&action);
                timers.deregister(&action);
                self.active_mitigations.retain(|_, owner| owner != &action);
            }
        }
    }

    /// Registers a new action under `client_name`. Returns the handler's
    /// self-raised detection request when the action is an anomaly trigger.
    pub fn register_action(
        &mut self,
        client_name: &str,
        action_name: &str,
        now: Timestamp,
        timers: &mut TimerSet,
    ) -> Result<Option<crate::message::Message>, HandlerError> {
        if !self.clients.contains_key(client_name) {
            return Err(HandlerError::UnknownClient(client_name.to_string()));
        }
        let config = self
            .config
            .actions
            .get(action_name)
            .cloned()
            .ok_or_else(|| HandlerError::Unconfigured(action_name.to_string()))?;
        if config.is_disabled() {
            return Err(HandlerError::Disabled(action_name.to_string()));
        }
        if let Some(existing) = self.handlers.get(action_name) {
            return Err(HandlerError::AlreadyOwned(
                action_name.to_string(),
                existing.client_name.clone(),
            ));
        }

        let is_anomaly = self.config.is_anomaly(action_name);
        let handler = if is_anomaly {
            Handler::new_anomaly(client_name, action_name, config)
        } else {
            Handler::new(client_name, action_name, config)
        };
        self.handlers.insert(action_name.to_string(), handler);
        self.clients
            .get_mut(client_name)
            .expect("checked above")
            .push(action_name.to_string());

        if is_anomaly {
            Ok(Some(self.self_raise_anomaly(action_name, now, timers)?))
        } else {
            Ok(None)
        }
    }

    pub fn handler(&self, action_name: &str) -> Option<&Handler> {
        self.handlers.get(action_name)
    }

    pub fn handler_mut(&mut self, action_name: &str) -> Option<&mut Handler> {
        self.handlers.get_mut(action_name)
    }

    /// Self-raises the named anomaly handler and records its fresh instance
    /// id so child responses can be routed back to it later.
    pub fn self_raise_anomaly(
        &mut self,
        action_name: &str,
        now: Timestamp,
        timers: &mut TimerSet,
    ) -> Result<crate::message::Message, HandlerError> {
        self.active_mitigations.retain(|_, owner| owner != action_name);
        let handler = self
            .handlers
            .get_mut(action_name)
            .ok_or_else(|| HandlerError::UnknownAction(action_name.to_string()))?;
        let msg = handler.self_raise(now, timers)?;
        if let Some(instance_id) = handler.current_instance_id() {
            self.active_mitigations
                .insert(instance_id.to_string(), action_name.to_string());
        }
        Ok(msg)
    }

    /// The anomaly action handler that raised `anomaly_instance_id`, if any
    /// mitigation cycle for it is still live.
    pub fn anomaly_action_for_instance(&self, anomaly_instance_id: &str) -> Option<&str> {
        self.active_mitigations
            .get(anomaly_instance_id)
            .map(String::as_str)
    }

    /// Re-indexes `action_name`'s current instance id after it self-raised
    /// without going through [`ActionManager::self_raise_anomaly`] (the
    /// empty-plan and sequence-complete paths raise internally).
    pub fn refresh_instance_index(&mut self, action_name: &str) {
        self.active_mitigations.retain(|_, owner| owner != action_name);
        if let Some(handler) = self.handlers.get(action_name) {
            if let Some(instance_id) = handler.current_instance_id() {
                self.active_mitigations
                    .insert(instance_id.to_string(), action_name.to_string());
            }
        }
    }

    /// Resolves a bound action list into handler names, per §4.6.1: a
    /// missing handler or a disabled configuration makes the whole plan
    /// empty.
    pub fn compute_plan(&self, anomaly_name: &str) -> Vec<String> {
        let Some(bound) = self.config.bindings.get(anomaly_name) else {
            return Vec::new();
        };
        let mut plan = Vec::with_capacity(bound.len());
        for action_name in bound {
            match self.handlers.get(action_name) {
                Some(handler) if !handler.config.is_disabled() => plan.push(action_name.clone()),
                _ => return Vec::new(),
            }
        }
        plan
    }

    pub fn action_names(&self) -> impl Iterator<Item = &String> {
        self.handlers.keys()
    }

    pub fn client_names(&self) -> impl Iterator<Item = &String> {
        self.clients.keys()
    }
}
