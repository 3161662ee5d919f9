// Agent bridge: task lifecycle coordination and its HTTP/WebSocket front door
// Shared between the daemon binary and the integration tests

pub mod api;
pub mod auth;
pub mod config;
pub mod coordinator;
pub mod http;
pub mod ids;
pub mod protocol;
pub mod push;
pub mod runner;
pub mod server;
pub mod settings;
pub mod sink;
pub mod validation;
