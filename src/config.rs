use std::{env, path::PathBuf, time::Duration};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DATA_PATH: &str = "data/orbit.json";
pub const DEFAULT_HEARTBEAT_SECS: u64 = 120;
pub const DEFAULT_TRANSACTION_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_path: PathBuf,
    pub session: SessionConfig,
}

/// Settings each loaded session is created with.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub admin_emails: Vec<String>,
    pub heartbeat_interval: Duration,
    pub transaction_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            admin_emails: Vec::new(),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            transaction_limit: DEFAULT_TRANSACTION_LIMIT,
        }
    }
}

impl SessionConfig {
    pub fn is_admin_email(&self, email: Option<&str>) -> bool {
        let Some(email) = email else {
            return false;
        };
        let email = email.trim().to_lowercase();
        !email.is_empty() && self.admin_emails.iter().any(|admin| *admin == email)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = lookup("PORT")
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let data_path = lookup("ORBIT_DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_PATH));
        let admin_emails = lookup("ORBIT_ADMIN_EMAILS")
            .map(|value| parse_emails(&value))
            .unwrap_or_default();
        let heartbeat_secs = lookup("ORBIT_HEARTBEAT_SECS")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_SECS);
        let transaction_limit = lookup("ORBIT_TRANSACTION_LIMIT")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_TRANSACTION_LIMIT);

        Self {
            port,
            data_path,
            session: SessionConfig {
                admin_emails,
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
                transaction_limit,
            },
        }
    }
}

fn parse_emails(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|email| email.trim().to_lowercase())
        .filter(|email| !email.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.data_path, PathBuf::from(DEFAULT_DATA_PATH));
        assert!(cfg.session.admin_emails.is_empty());
        assert_eq!(cfg.session.heartbeat_interval, Duration::from_secs(120));
        assert_eq!(cfg.session.transaction_limit, 50);
    }

    #[test]
    fn bad_numbers_fall_back_to_defaults() {
        let cfg = config(&[("PORT", "http"), ("ORBIT_HEARTBEAT_SECS", "0")]);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.session.heartbeat_interval, Duration::from_secs(120));
    }

    #[test]
    fn admin_emails_are_case_insensitive() {
        let cfg = config(&[("ORBIT_ADMIN_EMAILS", " Boss@Example.com, ,ops@example.com")]);
        assert_eq!(cfg.session.admin_emails.len(), 2);
        assert!(cfg.session.is_admin_email(Some("boss@example.COM")));
        assert!(!cfg.session.is_admin_email(Some("someone@example.com")));
        assert!(!cfg.session.is_admin_email(None));
    }
}
