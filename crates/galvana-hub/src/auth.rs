// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer-token principal resolution. The pipeline only ever consumes a
//! resolved principal string; how a token maps to one is delegated to an
//! [`AuthOracle`] so a real deployment can swap in whatever identity system
//! fronts it without touching connection or safety logic.

/// Resolves a bearer token to a principal identifier.
pub trait AuthOracle: Send + Sync {
    fn resolve(&self, token: Option<&str>) -> Result<String, crate::error::HubError>;
    fn is_superuser(&self, principal: &str) -> bool;
}

/// Development-mode oracle: a single shared secret, or none at all.
///
/// If `expected` is `None`, any token (including none) resolves to principal
/// `"anonymous"` — explicitly a development convenience, never the default in
/// a deployed configuration.
pub struct StaticTokenOracle {
    expected: Option<String>,
    superusers: Vec<String>,
}

impl StaticTokenOracle {
    pub fn new(expected: Option<String>) -> Self {
        Self { expected, superusers: Vec::new() }
    }

    pub fn with_superusers(mut self, superusers: Vec<String>) -> Self {
        self.superusers = superusers;
        self
    }
}

impl AuthOracle for StaticTokenOracle {
    fn resolve(&self, token: Option<&str>) -> Result<String, crate::error::HubError> {
        match &self.expected {
            None => Ok("anonymous".to_owned()),
            Some(expected) => match token {
                Some(token) if constant_time_eq(token, expected) => Ok(principal_from_token(token)),
                _ => Err(crate::error::HubError::Unauthenticated),
            },
        }
    }

    fn is_superuser(&self, principal: &str) -> bool {
        self.superusers.iter().any(|s| s == principal)
    }
}

/// Treats the token itself as the principal, once it has authenticated.
/// Stands in for whatever claim extraction a real token format would need.
fn principal_from_token(token: &str) -> String {
    token.to_owned()
}

/// Constant-time string comparison to avoid a timing side channel on token
/// verification.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubError;

    #[test]
    fn no_configured_token_admits_anonymous() {
        let oracle = StaticTokenOracle::new(None);
        assert_eq!(oracle.resolve(None).unwrap(), "anonymous");
        assert_eq!(oracle.resolve(Some("anything")).unwrap(), "anonymous");
    }

    #[test]
    fn wrong_token_is_unauthenticated() {
        let oracle = StaticTokenOracle::new(Some("secret".to_owned()));
        assert_eq!(oracle.resolve(Some("wrong")).unwrap_err(), HubError::Unauthenticated);
        assert_eq!(oracle.resolve(None).unwrap_err(), HubError::Unauthenticated);
    }

    #[test]
    fn matching_token_resolves_a_principal() {
        let oracle = StaticTokenOracle::new(Some("secret".to_owned()));
        assert_eq!(oracle.resolve(Some("secret")).unwrap(), "secret");
    }

    #[test]
    fn superuser_list_is_consulted() {
        let oracle = StaticTokenOracle::new(Some("secret".to_owned())).with_superusers(vec!["secret".to_owned()]);
        assert!(oracle.is_superuser("secret"));
        assert!(!oracle.is_superuser("other"));
    }
}
