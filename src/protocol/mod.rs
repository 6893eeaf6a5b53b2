//! Wire formats: gateway messages, bus events, store records

pub mod events;

pub use events::*;
