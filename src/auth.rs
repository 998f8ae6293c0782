//! Auth-domain models: modes, immutable credentials, issued tokens, and redacted secrets.

pub mod credential;
pub mod mode;
pub mod secret;
pub mod token;

pub use credential::*;
pub use mode::*;
pub use secret::*;
pub use token::*;
