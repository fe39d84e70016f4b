//! Bearer-token authorization: context projection, JWKS-backed JWT
//! verification with introspection fallback, and the request pipeline.

pub mod context;
pub mod jwks;
pub mod pipeline;
pub mod token;

pub use context::{token_hash, AuthorizationContext, TokenRefresh};
pub use jwks::JwksCache;
pub use pipeline::{authorize, AuthChallenge, AuthState, OAuthRefreshClient, RefreshedToken};
pub use token::{TokenError, TokenValidator};
