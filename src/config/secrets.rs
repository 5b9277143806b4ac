//! Connection-string secrets.
//!
//! URLs carry passwords, so they stay wrapped in [`SecretString`] until a
//! client is opened. [`redacted_url`] gives a form safe to log.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// The URL with any password in its user-info replaced by `***`.
pub fn redacted_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "***".to_string();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return raw.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => format!("{scheme}://{userinfo}@{host}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redact(url: &str) -> String {
        redacted_url(&SecretString::from(url))
    }

    #[test]
    fn hides_passwords_only() {
        assert_eq!(
            redact("postgres://app:hunter2@db:5432/leaseq"),
            "postgres://app:***@db:5432/leaseq"
        );
        assert_eq!(redact("redis://:hunter2@cache:6379"), "redis://:***@cache:6379");
        assert_eq!(redact("redis://cache:6379"), "redis://cache:6379");
        assert_eq!(redact("not a url"), "***");
    }
}
