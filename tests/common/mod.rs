//! Shared helpers for the test suites.

#![allow(dead_code)]

pub mod fixtures;
