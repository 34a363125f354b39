use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch seconds (UTC). `0` is used as a sentinel for "no deadline" on the lock.
pub type Timestamp = i64;

/// Synthetic result code used when a request times out. Mirrors POSIX `ETIMEDOUT`.
pub const ETIMEDOUT: i32 = 110;

/// Result code stamped onto a mitigation run whose plan could not be built
/// (an unresolved or disabled bound action).
pub const ERR_NO_PLAN: i32 = 1;

/// Result code stamped onto a mitigation run where an action was skipped by
/// the recurrence window.
pub const ERR_RECURRENCE_SUPPRESSED: i32 = 2;

/// Result code stamped onto a mitigation run where a plan element refused to
/// run because a prior step had already failed and it is not mandatory.
pub const ERR_PRECONDITION_REFUSED: i32 = 3;

/// Default per-request timeout, in seconds, when `timeout_seconds` is unset.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// Upper clamp for `timeout_seconds`.
pub const MAX_TIMEOUT_SECONDS: u64 = 300;

/// Default mitigation-level timeout, in seconds, for anomaly actions.
pub const DEFAULT_MITIGATION_TIMEOUT_SECONDS: u64 = 120;

/// Default heartbeat publication interval, in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 5;

// ─── Action configuration ──────────────────────────────────────

/// One action's configuration record, as loaded from `actions.conf.json`.
///
/// Every field is optional in the file; defaults and clamping are applied by
/// [`ActionConfig::effective_timeout`] and friends rather than at parse time,
/// so the raw record stays a faithful reflection of what was on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionConfig {
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub disable: Option<bool>,
    #[serde(default)]
    pub mimic: Option<bool>,
    #[serde(default)]
    pub mandatory: Option<bool>,
    #[serde(default)]
    pub min_recurrence_seconds: Option<u64>,
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<u64>,
    #[serde(default)]
    pub mitigation_timeout_seconds: Option<u64>,
}

impl ActionConfig {
    /// The per-request timeout, defaulted and clamped per §3.
    pub fn effective_timeout(&self) -> u64 {
        self.timeout_seconds
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS)
            .min(MAX_TIMEOUT_SECONDS)
    }

    /// The mitigation-level timeout for an anomaly action.
    pub fn effective_mitigation_timeout(&self) -> u64 {
        self.mitigation_timeout_seconds
            .unwrap_or(DEFAULT_MITIGATION_TIMEOUT_SECONDS)
    }

    pub fn is_disabled(&self) -> bool {
        self.disable.unwrap_or(false)
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory.unwrap_or(false)
    }

    pub fn is_mimic(&self) -> bool {
        self.mimic.unwrap_or(false)
    }

    pub fn recurrence_window(&self) -> u64 {
        self.min_recurrence_seconds.unwrap_or(0)
    }
}

/// Object of `action_name -> config record`, from `actions.conf.json`.
pub type ActionsConfig = BTreeMap<String, ActionConfig>;

/// Object of `anomaly_name -> ordered remediation plan`, from `bindings.conf.json`.
pub type Bindings = BTreeMap<String, Vec<String>>;

/// Client allow-list, from `procs.conf.json`. Order is preserved as loaded.
pub type ProcList = Vec<String>;

/// Engine-wide globals, from `lom.rc.json`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Globals {
    pub heartbeat_interval_seconds: u64,
}

impl Default for Globals {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
        }
    }
}

/// The three validated config records plus globals, bundled for a single reload.
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub actions: ActionsConfig,
    pub bindings: Bindings,
    pub procs: ProcList,
    pub globals: Globals,
}

impl Configuration {
    /// An action is classified as an anomaly iff it is a key in the binding table.
    pub fn is_anomaly(&self, action_name: &str) -> bool {
        self.bindings.contains_key(action_name)
    }
}

// ─── Action state machine ──────────────────────────────────────

/// Position of an action's state machine. `LockPending` and `Mitigating` are
/// only ever entered by anomaly handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionState {
    None,
    Active,
    TimedOut,
    LockPending,
    Mitigating,
}

impl Default for ActionState {
    fn default() -> Self {
        ActionState::None
    }
}
