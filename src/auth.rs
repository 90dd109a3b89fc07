/// Supplies the local bearer credential for firmware generations that gate
/// the local API behind token auth. How the token is obtained (Enlighten
/// cloud login, owner token, installer flow) is outside this crate; the
/// client only asks for the current credential and whether it needs renewal.
pub trait TokenProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;

    /// Checked before each refresh cycle. Returning true makes the cycle
    /// fail fast with `Error::AuthRequired` instead of probing with a
    /// credential known to be stale.
    fn needs_reauth(&self) -> bool {
        false
    }
}

/// No credential at all. Pre-D7 firmware serves the local API open.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl TokenProvider for NoAuth {
    fn bearer_token(&self) -> Option<String> {
        None
    }
}

/// A fixed token, e.g. a long-lived owner token fetched out of band.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        Some(self.token.clone())
    }
}
