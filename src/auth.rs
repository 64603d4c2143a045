//! Credentials, token state, and the per-request authorization step.

pub mod assertion;
pub mod authorizer;
pub mod dpop;
pub mod mode;
pub mod scope;
pub mod secret;
pub mod state;

pub use assertion::*;
pub use authorizer::*;
pub use dpop::*;
pub use mode::*;
pub use scope::*;
pub use secret::*;
pub use state::*;
