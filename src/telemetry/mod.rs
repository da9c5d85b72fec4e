//! Background status listener

mod listener;

pub use listener::TelemetryListener;
