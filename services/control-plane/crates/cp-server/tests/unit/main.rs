//! Unit tests for the fleet control plane
//!
//! These tests run against the in-memory store and mocked metadata ports,
//! without Valkey or any other external I/O.

mod http;
mod mocks;
mod update_processor;
