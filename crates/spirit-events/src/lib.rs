//! Bounded, drop-oldest event queue feeding external events to the agent
//! loop. See spec §4.6.

pub mod dispatcher;

pub use dispatcher::{EventDispatcher, EventSink};
pub use spirit_memory::types::ExternalEvent;
