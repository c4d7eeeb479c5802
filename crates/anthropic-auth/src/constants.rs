//! Anthropic OAuth constants
//!
//! Public OAuth client configuration matching the Claude CLI. These values
//! are not secrets — they identify the public client application. The actual
//! secrets (access/refresh tokens) are managed by the credential store.

/// Anthropic's public OAuth client ID (same as Claude CLI)
pub const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// OAuth redirect URI (Anthropic's hosted callback page)
pub const REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";

/// Token endpoint for code exchange, token refresh, and revocation.
pub const TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Revocation endpoint.
pub const REVOKE_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/revoke";

/// Authorization endpoint for `max` mode (Pro/Max subscriptions via claude.ai).
pub const AUTHORIZE_ENDPOINT_MAX: &str = "https://claude.ai/oauth/authorize";

/// Authorization endpoint for `console` mode (API console, same client).
pub const AUTHORIZE_ENDPOINT_CONSOLE: &str = "https://console.anthropic.com/oauth/authorize";

/// OAuth scopes requested during authorization.
pub const SCOPES: &str = "org:create_api_key user:profile user:inference";

/// Authorization mode selecting which endpoint to hit. `Max` covers Pro/Max
/// subscriptions; `Console` covers API-console accounts. Both use the same
/// client id, redirect URI, and scopes — only the host differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizeMode {
    Max,
    Console,
}

impl AuthorizeMode {
    pub fn endpoint(self) -> &'static str {
        match self {
            AuthorizeMode::Max => AUTHORIZE_ENDPOINT_MAX,
            AuthorizeMode::Console => AUTHORIZE_ENDPOINT_CONSOLE,
        }
    }
}
