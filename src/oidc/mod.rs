//! OAuth 2.0 / OIDC protocol pieces

pub mod callback;
pub mod discovery;
pub mod id_token;
pub mod pkce;
pub mod token;

pub use callback::CallbackParams;
pub use discovery::ProviderMetadata;
pub use id_token::IdentityClaims;
pub use pkce::PkceParams;
pub use token::{ClientAuthMethod, ClientCredentials, TokenClient, TokenExchange, TokenSet};
