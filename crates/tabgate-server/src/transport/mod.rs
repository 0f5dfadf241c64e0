//! Socket transports.

pub mod websocket;
