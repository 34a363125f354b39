use thiserror::Error;

/// Errors raised while loading or validating the four configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path} is missing or unreadable: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {path} is empty")]
    Empty { path: String },
    #[error("config file {path} has invalid JSON: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("bindings entry {anomaly:?} has a non-numeric plan index {index:?}")]
    BadPlanIndex { anomaly: String, index: String },
}

/// Errors raised by the message model: validation, unknown keys, bad framing.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message object has no top-level variant key")]
    MissingVariant,
    #[error("unrecognized message variant {0:?}")]
    UnknownVariant(String),
    #[error("missing required attribute {0:?}")]
    MissingAttribute(&'static str),
    #[error("required attribute {0:?} must not be empty")]
    EmptyAttribute(&'static str),
    #[error("attribute {0:?} is not valid for this variant")]
    UnknownAttribute(String),
    #[error("invalid value for attribute {0:?}: {1}")]
    InvalidValue(&'static str, String),
    #[error("frame of {0} bytes exceeds the 2048-byte maximum")]
    FrameTooLarge(usize),
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by per-action and anomaly-sequence state machines.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("action {0:?} is not idle")]
    NotIdle(String),
    #[error("action {0:?} refused: prior failure and action is not mandatory")]
    MandatoryPrecondition(String),
    #[error("action {0:?} refused: inside its recurrence window")]
    RecurrenceSuppressed(String),
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("unknown client {0:?}")]
    UnknownClient(String),
    #[error("action {0:?} is already owned by client {1:?}")]
    AlreadyOwned(String, String),
    #[error("action {0:?} registration refused: disabled")]
    Disabled(String),
    #[error("action {0:?} has no configuration record")]
    Unconfigured(String),
    #[error("action {0:?} is an anomaly action and cannot be raised externally")]
    AnomalySelfRaiseOnly(String),
    #[error("child response for {0:?} arrived but the mitigation lock is not held by it")]
    LockNotHeld(String),
    #[error("child response for {0:?} does not match the current plan element")]
    StalePlanElement(String),
    #[error("child response for {0:?} carries anomaly_key {1:?}, expected {2:?}")]
    AnomalyKeyMismatch(String, String, String),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised by the FIFO transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error on client {client:?}: {source}")]
    Io {
        client: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown client {0:?}")]
    UnknownClient(String),
    #[error("frame of {0} bytes exceeds the 2048-byte maximum")]
    FrameTooLarge(usize),
    #[error("peer for client {0:?} closed the connection")]
    Closed(String),
}

/// Fatal errors that terminate the engine's main loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to initialize transport: {0}")]
    TransportInit(String),
    #[error("failed to initialize the event publisher: {0}")]
    PublisherInit(String),
}
