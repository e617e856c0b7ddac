// src/tests/mod.rs

mod metrics_tests;
mod retry_tests;
