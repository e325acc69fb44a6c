use crate::core::{ContextError, Result};
use std::time::Duration;

/// Longest accepted session TTL: one year.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Scope behaviour and session storage settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Commit the scope's transaction on normal exit
    pub auto_commit: bool,

    /// Attach a change tracker when the manager has none
    pub trace_changes: bool,

    /// Sliding expiry of stored sessions
    pub session_ttl: Duration,

    /// Store key namespace; keys are `"{prefix}:{token}"`
    pub key_prefix: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            auto_commit: false,
            trace_changes: false,
            session_ttl: Duration::from_secs(3600),
            key_prefix: "session".to_string(),
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    pub fn trace_changes(mut self, enabled: bool) -> Self {
        self.trace_changes = enabled;
        self
    }

    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    /// Parse from a connection string
    ///
    /// Format: `"memory://<prefix>?ttl=<secs>&auto_commit=<bool>&trace_changes=<bool>"`;
    /// every part after the scheme is optional.
    ///
    /// ```
    /// use webcontext::context::ContextConfig;
    ///
    /// let config = ContextConfig::from_url("memory://session?ttl=3600&auto_commit=true").unwrap();
    /// assert!(config.auto_commit);
    /// assert_eq!(config.session_ttl.as_secs(), 3600);
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("memory://")
            .ok_or_else(|| ContextError::Config("URL must start with 'memory://'".into()))?;

        let (prefix, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut config = Self::new();
        if !prefix.is_empty() {
            config.key_prefix = prefix.to_string();
        }

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ContextError::Config(format!("Missing value for '{}'", pair)))?;
            match key {
                "ttl" => {
                    let secs = value
                        .parse::<u64>()
                        .map_err(|_| ContextError::Config(format!("Invalid ttl '{}'", value)))?;
                    config.session_ttl = Duration::from_secs(secs);
                }
                "auto_commit" => config.auto_commit = parse_flag(key, value)?,
                "trace_changes" => config.trace_changes = parse_flag(key, value)?,
                other => return Err(ContextError::Config(format!("Unknown option '{}'", other))),
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn to_url(&self) -> String {
        format!(
            "memory://{}?ttl={}&auto_commit={}&trace_changes={}",
            self.key_prefix,
            self.session_ttl.as_secs(),
            self.auto_commit,
            self.trace_changes
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(ContextError::Config("key_prefix cannot be empty".into()));
        }
        if self.key_prefix.contains(':') {
            return Err(ContextError::Config("key_prefix cannot contain ':'".into()));
        }
        if self.session_ttl.is_zero() {
            return Err(ContextError::Config("session_ttl must be > 0".into()));
        }
        if self.session_ttl > MAX_SESSION_TTL {
            return Err(ContextError::Config(format!(
                "session_ttl must be at most {}s",
                MAX_SESSION_TTL.as_secs()
            )));
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ContextError::Config(format!("Invalid value '{}' for '{}'", value, key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ContextConfig::default();
        assert!(!config.auto_commit);
        assert!(!config.trace_changes);
        assert_eq!(config.session_ttl, Duration::from_secs(3600));
        assert_eq!(config.key_prefix, "session");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_url() {
        let config = ContextConfig::from_url("memory://web?ttl=60&auto_commit=1&trace_changes=true").unwrap();
        assert_eq!(config.key_prefix, "web");
        assert_eq!(config.session_ttl, Duration::from_secs(60));
        assert!(config.auto_commit);
        assert!(config.trace_changes);
        assert_eq!(ContextConfig::from_url(&config.to_url()).unwrap(), config);

        assert_eq!(ContextConfig::from_url("memory://").unwrap(), ContextConfig::default());
    }

    #[test]
    fn test_from_url_rejects_bad_input() {
        assert!(ContextConfig::from_url("redis://localhost").is_err());
        assert!(ContextConfig::from_url("memory://s?ttl=soon").is_err());
        assert!(ContextConfig::from_url("memory://s?ttl=0").is_err());
        assert!(ContextConfig::from_url("memory://s?ttl=18446744073709551615").is_err());
        assert!(ContextConfig::from_url("memory://s?ttl=31536000").is_ok());
        assert!(ContextConfig::from_url("memory://s?auto_commit=yes").is_err());
        assert!(ContextConfig::from_url("memory://s?pool=4").is_err());
    }
}
