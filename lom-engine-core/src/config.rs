//! Loads and validates the four on-disk configuration files (§6) into the
//! typed records in [`crate::types`].

use crate::error::ConfigError;
use crate::types::{ActionConfig, ActionsConfig, Bindings, Configuration, Globals, ProcList};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_DIR: &str = "/usr/shared/LoM/config";
pub const CONFIG_PATH_ENV: &str = "LOM_CONFIG_PATH";

const ACTIONS_FILE: &str = "actions.conf.json";
const BINDINGS_FILE: &str = "bindings.conf.json";
const PROCS_FILE: &str = "procs.conf.json";
const GLOBALS_FILE: &str = "lom.rc.json";

/// The directory to load configuration from: `$LOM_CONFIG_PATH` if set and
/// non-empty, else [`DEFAULT_CONFIG_DIR`].
pub fn config_dir() -> PathBuf {
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_DIR),
    }
}

fn read_json(path: &Path) -> Result<Json, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    if text.trim().is_empty() {
        return Err(ConfigError::Empty {
            path: path.display().to_string(),
        });
    }
    serde_json::from_str(&text).map_err(|source| ConfigError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Loads `actions.conf.json`: an object of `action_name -> config record`.
pub fn load_actions(dir: &Path) -> Result<ActionsConfig, ConfigError> {
    let value = read_json(&dir.join(ACTIONS_FILE))?;
    let obj = value.as_object().cloned().unwrap_or_default();
    let mut actions = ActionsConfig::new();
    for (name, record) in obj {
        let config: ActionConfig = serde_json::from_value(record).map_err(|source| ConfigError::Json {
            path: dir.join(ACTIONS_FILE).display().to_string(),
            source,
        })?;
        actions.insert(name, config);
    }
    Ok(actions)
}

/// Loads `bindings.conf.json`: an object of `anomaly_name -> { "<index>":
/// "<action_name>", … }`, with indices sorted numerically into an ordered
/// plan.
pub fn load_bindings(dir: &Path) -> Result<Bindings, ConfigError> {
    let value = read_json(&dir.join(BINDINGS_FILE))?;
    let obj = value.as_object().cloned().unwrap_or_default();
    let mut bindings = Bindings::new();
    for (anomaly, plan_obj) in obj {
        let plan_map = plan_obj.as_object().cloned().unwrap_or_default();
        let mut indexed: BTreeMap<u64, String> = BTreeMap::new();
        for (index_str, action) in plan_map {
            let index: u64 = index_str.parse().map_err(|_| ConfigError::BadPlanIndex {
                anomaly: anomaly.clone(),
                index: index_str.clone(),
            })?;
            let action = action.as_str().unwrap_or_default().to_string();
            indexed.insert(index, action);
        }
        bindings.insert(anomaly, indexed.into_values().collect());
    }
    Ok(bindings)
}

/// Loads `procs.conf.json`: the allowed client names, in file order.
pub fn load_procs(dir: &Path) -> Result<ProcList, ConfigError> {
    let value = read_json(&dir.join(PROCS_FILE))?;
    let obj = value.as_object().cloned().unwrap_or_default();
    Ok(obj.keys().cloned().collect())
}

/// Loads `lom.rc.json`: engine-wide globals.
pub fn load_globals(dir: &Path) -> Result<Globals, ConfigError> {
    let value = read_json(&dir.join(GLOBALS_FILE))?;
    let heartbeat_interval_seconds = value
        .get("HEARTBEAT_INTERVAL")
        .and_then(Json::as_u64)
        .unwrap_or(crate::types::DEFAULT_HEARTBEAT_INTERVAL_SECONDS);
    Ok(Globals {
        heartbeat_interval_seconds,
    })
}

/// Loads all four files from `dir` into one bundled [`Configuration`]. Any
/// missing or empty file is fatal (§4.7 step 2).
pub fn load(dir: &Path) -> Result<Configuration, ConfigError> {
    Ok(Configuration {
        actions: load_actions(dir)?,
        bindings: load_bindings(dir)?,
        procs: load_procs(dir)?,
        globals: load_globals(dir)?,
    })
}
