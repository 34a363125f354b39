//! Core logic for the on-device anomaly-mitigation orchestration engine:
//! the message model, timer set, lock manager, action/anomaly handlers,
//! manager registries, configuration loading, the event-publisher trait,
//! and the dispatcher/main-loop orchestration. No direct transport I/O
//! lives here; the server crate supplies a concrete [`engine::Transport`].

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod lock;
pub mod manager;
pub mod message;
pub mod publish;
pub mod timer;
pub mod types;

pub use engine::{Engine, LoopControl, Transport};
pub use error::{ConfigError, EngineError, HandlerError, MessageError, TransportError};
pub use handler::Handler;
pub use lock::{LockManager, LockOutcome};
pub use manager::ActionManager;
pub use message::{Message, Variant};
pub use publish::{EventPublisher, TracingPublisher};
pub use timer::TimerSet;
pub use types::{ActionConfig, ActionState, Configuration, Globals};
