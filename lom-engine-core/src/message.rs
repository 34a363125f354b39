//! The wire message model: tagged request/response variants, flat string
//! attributes, and validation. A message is always a JSON object with
//! exactly one top-level key naming the variant; the value is a flat map of
//! string attributes (§4.2, §6).

use crate::error::MessageError;
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Maximum encoded frame size, in bytes, accepted by the transport.
pub const MAX_FRAME_BYTES: usize = 2048;

pub const KEY_CLIENT_NAME: &str = "client_name";
pub const KEY_ACTION_NAME: &str = "action_name";
pub const KEY_REQUEST_TYPE: &str = "request_type";
pub const KEY_INSTANCE_ID: &str = "instance_id";
pub const KEY_ANOMALY_INSTANCE_ID: &str = "anomaly_instance_id";
pub const KEY_ANOMALY_KEY: &str = "anomaly_key";
pub const KEY_CONTEXT: &str = "context";
pub const KEY_TIMEOUT: &str = "timeout";
pub const KEY_HEARTBEAT_INTERVAL: &str = "heartbeat_interval";
pub const KEY_ACTION_DATA: &str = "action_data";
pub const KEY_RESULT_CODE: &str = "result_code";
pub const KEY_RESULT_STR: &str = "result_str";

/// `request_type` value for a normal mitigation action request.
pub const REQUEST_TYPE_ACTION: &str = "action";
/// `request_type` value for the shutdown flow.
pub const REQUEST_TYPE_SHUTDOWN: &str = "shutdown";

/// `anomaly_instance_id` must be present on every request/response, but an
/// anomaly's own detection traffic (it has no parent) legitimately carries
/// it empty; every other required key must be non-empty.
fn required_key_allows_empty(key: &str) -> bool {
    key == KEY_ANOMALY_INSTANCE_ID
}

/// The seven wire message variants (§3, §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Variant {
    RegisterClient,
    DeregisterClient,
    RegisterAction,
    Heartbeat,
    ActionRequest,
    ActionResponse,
    Shutdown,
}

impl Variant {
    /// The top-level JSON key naming this variant.
    pub fn tag(self) -> &'static str {
        match self {
            Variant::RegisterClient => "register_client",
            Variant::DeregisterClient => "deregister_client",
            Variant::RegisterAction => "register_action",
            Variant::Heartbeat => "heartbeat",
            Variant::ActionRequest => "action_request",
            Variant::ActionResponse => "action_response",
            Variant::Shutdown => "shutdown",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, MessageError> {
        Ok(match tag {
            "register_client" => Variant::RegisterClient,
            "deregister_client" => Variant::DeregisterClient,
            "register_action" => Variant::RegisterAction,
            "heartbeat" => Variant::Heartbeat,
            "action_request" => Variant::ActionRequest,
            "action_response" => Variant::ActionResponse,
            "shutdown" => Variant::Shutdown,
            other => return Err(MessageError::UnknownVariant(other.to_string())),
        })
    }

    pub fn required_keys(self) -> &'static [&'static str] {
        match self {
            Variant::RegisterClient | Variant::DeregisterClient => &[KEY_CLIENT_NAME],
            Variant::RegisterAction => &[KEY_CLIENT_NAME, KEY_ACTION_NAME],
            Variant::Heartbeat => &[KEY_CLIENT_NAME, KEY_ACTION_NAME, KEY_INSTANCE_ID],
            Variant::ActionRequest => &[
                KEY_CLIENT_NAME,
                KEY_ACTION_NAME,
                KEY_REQUEST_TYPE,
                KEY_INSTANCE_ID,
                KEY_ANOMALY_INSTANCE_ID,
            ],
            Variant::ActionResponse => &[
                KEY_CLIENT_NAME,
                KEY_ACTION_NAME,
                KEY_REQUEST_TYPE,
                KEY_INSTANCE_ID,
                KEY_ANOMALY_INSTANCE_ID,
                KEY_ACTION_DATA,
                KEY_RESULT_CODE,
            ],
            Variant::Shutdown => &[KEY_CLIENT_NAME, KEY_ACTION_NAME],
        }
    }

    pub fn optional_keys(self) -> &'static [&'static str] {
        match self {
            Variant::ActionRequest => {
                &[KEY_ANOMALY_KEY, KEY_CONTEXT, KEY_TIMEOUT, KEY_HEARTBEAT_INTERVAL]
            }
            Variant::ActionResponse => &[KEY_ANOMALY_KEY, KEY_RESULT_STR],
            _ => &[],
        }
    }
}

/// A decoded wire message: one variant tag plus its flat attribute map.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub variant: Variant,
    attrs: BTreeMap<String, String>,
}

impl Message {
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            attrs: BTreeMap::new(),
        }
    }

    /// Admits only required or optional keys of this variant. Required keys
    /// reject an empty value outright (§4.2).
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), MessageError> {
        let value = value.into();
        let required = self.variant.required_keys().contains(&key);
        let optional = self.variant.optional_keys().contains(&key);
        if !required && !optional {
            return Err(MessageError::UnknownAttribute(key.to_string()));
        }
        if required && value.is_empty() && !required_key_allows_empty(key) {
            return Err(MessageError::EmptyAttribute(
                self.variant
                    .required_keys()
                    .iter()
                    .find(|k| **k == key)
                    .copied()
                    .unwrap_or("?"),
            ));
        }
        self.attrs.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Every required attribute present and non-empty; no unknown keys.
    pub fn validate(&self) -> Result<(), MessageError> {
        for key in self.variant.required_keys() {
            match self.attrs.get(*key) {
                None => return Err(MessageError::MissingAttribute(key)),
                Some(v) if v.is_empty() && !required_key_allows_empty(key) => {
                    return Err(MessageError::EmptyAttribute(key))
                }
                Some(_) => {}
            }
        }
        for key in self.attrs.keys() {
            let k = key.as_str();
            if !self.variant.required_keys().contains(&k) && !self.variant.optional_keys().contains(&k)
            {
                return Err(MessageError::UnknownAttribute(key.clone()));
            }
        }
        Ok(())
    }

    pub fn equals(&self, other: &Message) -> bool {
        self == other
    }

    /// Canonical JSON form: `{ "<tag>": { sorted flat attrs } }`.
    pub fn to_json(&self) -> Json {
        let mut obj = serde_json::Map::new();
        obj.insert(
            self.variant.tag().to_string(),
            Json::Object(
                self.attrs
                    .iter()
                    .map(|(k, v)| (k.clone(), Json::String(v.clone())))
                    .collect(),
            ),
        );
        Json::Object(obj)
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let bytes = serde_json::to_vec(&self.to_json())?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(MessageError::FrameTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn from_json(value: &Json) -> Result<Self, MessageError> {
        let obj = value.as_object().ok_or(MessageError::MissingVariant)?;
        if obj.len() != 1 {
            return Err(MessageError::MissingVariant);
        }
        let (tag, body) = obj.iter().next().ok_or(MessageError::MissingVariant)?;
        let variant = Variant::from_tag(tag)?;
        let body = body.as_object().ok_or(MessageError::MissingVariant)?;

        let mut attrs = BTreeMap::new();
        for (k, v) in body {
            let s = match v {
                Json::String(s) => s.clone(),
                Json::Number(n) => n.to_string(),
                Json::Bool(b) => b.to_string(),
                _ => return Err(MessageError::InvalidValue("*", k.clone())),
            };
            attrs.insert(k.clone(), s);
        }
        let msg = Message { variant, attrs };
        msg.validate()?;
        Ok(msg)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(MessageError::FrameTooLarge(bytes.len()));
        }
        let value: Json = serde_json::from_slice(bytes)?;
        Self::from_json(&value)
    }
}
