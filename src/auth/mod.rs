//! Authentication layer: credentials, session identifiers, validators and the
//! request gate.

pub mod credentials;
pub mod middleware;
pub mod session;
pub mod validate;

pub use credentials::{Claims, CredentialError, CredentialService, TokenError};
pub use middleware::{
    current_session, current_user, optional_auth, require_admin, require_auth, require_premium,
    AppState, AuthContext, CurrentSession, CurrentUser, GateError,
};
pub use session::{generate_session_id, generate_verification_token};
pub use validate::{validate_email, validate_password, validate_username, ValidationError};
