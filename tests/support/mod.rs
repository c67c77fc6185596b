//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod fake_engine;
pub mod socket_guard;
