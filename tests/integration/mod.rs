//! Integration test helpers and utilities
//!
//! This module provides the test infrastructure for exercising the access layer:
//! - Scriptable mock database backends
//! - A mock memcached server for the remote cache tier
//! - An access layer fixture wired to the mocks


// Re-export commonly used helpers
pub use helpers::{
    mock_backend::{FailureMode, MockBackend},
    mock_memcached::{MockMemcached, MockMemcachedBuilder, ResponseMode},
    test_layer::TestLayer,
};
