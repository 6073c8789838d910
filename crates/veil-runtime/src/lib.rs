#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod backfill;
pub mod buffer;
pub mod consumer;
pub mod writer;
