// Task lifecycle coordinator, connection authorization and the front door
// (shared between the daemon binary and integration tests)
pub mod bridge;

// Async polling helpers and a recording event sink for tests
pub mod test_utils;
