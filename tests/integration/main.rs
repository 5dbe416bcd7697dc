//! Integration tests for listing-watch
//!
//! These tests use wiremock to serve listing payloads and drive full crawl
//! cycles end-to-end against a temporary SQLite store.

mod backoff_tests;
mod common;
mod concurrency_tests;
mod cycle_tests;
