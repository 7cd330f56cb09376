//! OAuth installation flow.
//!
//! Single-use `state` tokens plus the authorization-code exchange that
//! installs the gateway into a workspace.

pub mod error;
pub mod exchange;
pub mod state;

pub use error::OAuthError;
pub use exchange::{AuthorizationRequest, Credentials, OAuthClient, OAuthConfig};
pub use state::{ConsumedState, OAuthStateManager, StateConfig};
