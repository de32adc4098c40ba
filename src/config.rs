use anyhow::{anyhow, Context};
use std::path::PathBuf;

const MIN_SECRET_LEN: usize = 16;

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Cost {
    pub m_kib: u32,
    pub t: u32,
    pub p: u32,
}

impl Default for Argon2Cost {
    fn default() -> Self {
        Self {
            m_kib: 19456,
            t: 2,
            p: 1,
        }
    }
}

/// Process-level settings read once at start-up. Business settings that an
/// administrator may tune at runtime live in the workspace instead
/// (see `settings`).
#[derive(Debug, Clone)]
pub struct Config {
    pub token_secret: Vec<u8>,
    pub token_ttl_hours: i64,
    pub admin_secret: Option<String>,
    pub workspace: Option<PathBuf>,
    pub dev_mode: bool,
    pub argon2: Argon2Cost,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(env: Lookup<'_>) -> anyhow::Result<Self> {
        let token_secret = match non_empty(env, "TUTORD_TOKEN_SECRET") {
            Some(s) => {
                if s.len() < MIN_SECRET_LEN {
                    return Err(anyhow!(
                        "TUTORD_TOKEN_SECRET must be at least {} bytes",
                        MIN_SECRET_LEN
                    ));
                }
                s.into_bytes()
            }
            None => {
                let mut buf = vec![0u8; 32];
                getrandom::getrandom(&mut buf)
                    .map_err(|e| anyhow!(e.to_string()))
                    .context("failed to generate token secret")?;
                tracing::warn!(
                    "TUTORD_TOKEN_SECRET not set; using a random key, tokens will not survive a restart"
                );
                buf
            }
        };

        let token_ttl_hours = parse_or(env, "TUTORD_TOKEN_TTL_HOURS", 24i64)?;
        if !(1..=24 * 30).contains(&token_ttl_hours) {
            return Err(anyhow!("TUTORD_TOKEN_TTL_HOURS must be in 1..=720"));
        }

        let defaults = Argon2Cost::default();
        let argon2 = Argon2Cost {
            m_kib: parse_or(env, "TUTORD_ARGON2_M", defaults.m_kib)?,
            t: parse_or(env, "TUTORD_ARGON2_T", defaults.t)?,
            p: parse_or(env, "TUTORD_ARGON2_P", defaults.p)?,
        };

        let dev_mode = non_empty(env, "TUTORD_DEV_MODE")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            token_secret,
            token_ttl_hours,
            admin_secret: non_empty(env, "TUTORD_ADMIN_SECRET"),
            workspace: non_empty(env, "TUTORD_WORKSPACE").map(PathBuf::from),
            dev_mode,
            argon2,
        })
    }
}

/// Tracing filter directive. Resolved separately so logging can be up before
/// the rest of the configuration is validated.
pub fn log_filter_from_env() -> String {
    log_filter(&|key| std::env::var(key).ok())
}

fn log_filter(env: Lookup<'_>) -> String {
    non_empty(env, "TUTORD_LOG")
        .or_else(|| non_empty(env, "RUST_LOG"))
        .unwrap_or_else(|| "info".to_string())
}

fn non_empty(env: Lookup<'_>, key: &str) -> Option<String> {
    env(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T>(env: Lookup<'_>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(env, key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow!("{} is invalid ({}): {}", key, raw, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let vars = lookup(&[]);
        let cfg = Config::from_lookup(&|k| vars.get(k).cloned()).expect("config");
        assert_eq!(cfg.token_ttl_hours, 24);
        assert_eq!(cfg.token_secret.len(), 32);
        assert!(cfg.admin_secret.is_none());
        assert_eq!(cfg.argon2, Argon2Cost::default());
        assert_eq!(log_filter(&|k| vars.get(k).cloned()), "info");
        assert!(!cfg.dev_mode);
    }

    #[test]
    fn explicit_values_are_parsed() {
        let vars = lookup(&[
            ("TUTORD_TOKEN_SECRET", "0123456789abcdef0123"),
            ("TUTORD_TOKEN_TTL_HOURS", "2"),
            ("TUTORD_ADMIN_SECRET", "  office-master  "),
            ("TUTORD_ARGON2_M", "1024"),
            ("TUTORD_DEV_MODE", "true"),
        ]);
        let cfg = Config::from_lookup(&|k| vars.get(k).cloned()).expect("config");
        assert_eq!(cfg.token_secret, b"0123456789abcdef0123".to_vec());
        assert_eq!(cfg.token_ttl_hours, 2);
        assert_eq!(cfg.admin_secret.as_deref(), Some("office-master"));
        assert_eq!(cfg.argon2.m_kib, 1024);
        assert!(cfg.dev_mode);
    }

    #[test]
    fn short_secret_and_bad_numbers_are_rejected() {
        let vars = lookup(&[("TUTORD_TOKEN_SECRET", "short")]);
        assert!(Config::from_lookup(&|k| vars.get(k).cloned()).is_err());
        let vars = lookup(&[("TUTORD_TOKEN_TTL_HOURS", "soon")]);
        assert!(Config::from_lookup(&|k| vars.get(k).cloned()).is_err());
    }
}
