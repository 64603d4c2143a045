//! Retry decisions and backoff scheduling for the request pipeline.

pub mod backoff;
pub mod policy;

pub use backoff::*;
pub use policy::*;
