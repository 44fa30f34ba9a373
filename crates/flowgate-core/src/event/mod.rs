//! Event bus for broadcasting workflow events.

pub mod bus;
