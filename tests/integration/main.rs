//! Integration tests for chunkcache

mod cli_tests;
mod engine_tests;
