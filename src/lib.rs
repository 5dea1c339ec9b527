//! A tunnel broker that exposes local HTTP and TCP services through a public relay.
//!
//! Clients keep a single control connection open to the broker. Whenever a public
//! request arrives for one of their tunnels, the broker asks the client to open a
//! new proxy connection and splices the public connection through it.

mod addressing;
mod authorization;
mod config;
mod connection_handler;
mod connections;
mod control;
mod droppable_handle;
mod entrypoint;
mod error;
mod http;
mod pending;
mod ports;
mod protocol;
mod proxy_stream;
mod reactor;
mod repository;
mod tcp;
mod telemetry;

pub use config::{ApplicationConfig, Messages};
pub use entrypoint::entrypoint;
