//! Wire protocol and domain model shared by the realtime client crates.

pub mod domain;
pub mod error;
pub mod protocol;
