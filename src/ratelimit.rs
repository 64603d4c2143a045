//! Endpoint-class rate-limit accounting and the governed transport that consults it.

pub mod class;
pub mod governor;
pub mod table;

pub use class::*;
pub use governor::*;
pub use table::*;
