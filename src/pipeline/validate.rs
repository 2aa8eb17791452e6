//! Identifier validation for media URLs.

use super::IdentifierValidator;
use crate::config::ValidationSettings;
use url::Url;

/// Accepts URLs whose scheme and host are on an allow-list.
///
/// A host matches when it equals an allowed host or is a subdomain of one,
/// so `www.youtube.com` and `m.youtube.com` pass for `youtube.com`.
#[derive(Debug, Clone)]
pub struct UrlValidator {
    schemes: Vec<String>,
    hosts: Vec<String>,
}

impl UrlValidator {
    pub fn new<S, H>(schemes: S, hosts: H) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        H: IntoIterator,
        H::Item: Into<String>,
    {
        Self {
            schemes: schemes.into_iter().map(|s| s.into().to_lowercase()).collect(),
            hosts: hosts.into_iter().map(|h| h.into().to_lowercase()).collect(),
        }
    }

    pub fn from_settings(settings: &ValidationSettings) -> Self {
        Self::new(settings.allowed_schemes.clone(), settings.allowed_hosts.clone())
    }

    fn host_allowed(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        self.hosts.iter().any(|allowed| {
            host == *allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::from_settings(&ValidationSettings::default())
    }
}

impl IdentifierValidator for UrlValidator {
    fn validate(&self, identifier: &str) -> bool {
        let Ok(url) = Url::parse(identifier.trim()) else {
            return false;
        };
        if !self.schemes.iter().any(|s| s == url.scheme()) {
            return false;
        }
        url.host_str().is_some_and(|host| self.host_allowed(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_known_hosts() {
        let validator = UrlValidator::default();
        assert!(validator.validate("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(validator.validate("http://youtube.com/watch?v=abc"));
        assert!(validator.validate("https://youtu.be/dQw4w9WgXcQ"));
        assert!(validator.validate("https://m.youtube.com/watch?v=abc"));
    }

    #[test]
    fn test_rejects_everything_else() {
        let validator = UrlValidator::default();
        assert!(!validator.validate("not a url"));
        assert!(!validator.validate(""));
        assert!(!validator.validate("ftp://youtube.com/video"));
        assert!(!validator.validate("https://vimeo.com/12345"));
        assert!(!validator.validate("https://notyoutube.com/watch?v=abc"));
        assert!(!validator.validate("https://youtube.com.evil.net/watch"));
    }

    #[test]
    fn test_custom_allow_list() {
        let validator = UrlValidator::new(["https"], ["example.org"]);
        assert!(validator.validate("https://media.example.org/clip"));
        assert!(!validator.validate("http://example.org/clip"));
        assert!(!validator.validate("https://youtube.com/watch?v=abc"));
    }
}
