// Shared helpers for integration tests
#![allow(dead_code)]

pub mod bridge_guard;
pub mod polling;
