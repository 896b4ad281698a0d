//! Event bus connecting the engine to user interfaces.

pub mod bus;
pub mod log_layer;

pub use bus::{
    Event, EventBus, EventMessage, Listener, ListenerId, Payload, Signal, EVENT_BUFFER_SIZE,
};
pub use log_layer::{BusLogLayer, LogRecord};
