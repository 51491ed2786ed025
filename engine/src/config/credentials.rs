//! Replica credentials
//!
//! Reads the `[client]` section of a my.cnf-style file. The
//! `LOVESTATS_DB_USER` and `LOVESTATS_DB_PASSWORD` environment variables
//! take precedence over the file.

use sdk::errors::EngineError;
use std::fmt;
use std::fs;
use std::path::Path;

const USER_ENV: &str = "LOVESTATS_DB_USER";
const PASSWORD_ENV: &str = "LOVESTATS_DB_PASSWORD";

/// User and password for the upstream replicas
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Resolve credentials from the environment, then from `path`
    pub fn resolve(path: &Path) -> Result<Self, EngineError> {
        let from_file = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                EngineError::Config(format!("Failed to read credentials file: {}", e))
            })?;
            Some(Self::parse_cnf(&contents)?)
        } else {
            None
        };

        let user = std::env::var(USER_ENV)
            .ok()
            .or_else(|| from_file.as_ref().map(|c| c.user.clone()));
        let password = std::env::var(PASSWORD_ENV)
            .ok()
            .or_else(|| from_file.as_ref().map(|c| c.password.clone()));

        match (user, password) {
            (Some(user), Some(password)) => Ok(Self { user, password }),
            _ => Err(EngineError::Config(format!(
                "No replica credentials: set {} and {} or provide a [client] section in the credentials file",
                USER_ENV, PASSWORD_ENV
            ))),
        }
    }

    /// Parse the `[client]` section of a my.cnf file
    pub fn parse_cnf(contents: &str) -> Result<Self, EngineError> {
        let mut in_client = false;
        let mut user = None;
        let mut password = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                in_client = &line[1..line.len() - 1] == "client";
                continue;
            }
            if !in_client {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let value = unquote(value.trim()).to_string();
                match key.trim() {
                    "user" => user = Some(value),
                    "password" => password = Some(value),
                    _ => {}
                }
            }
        }

        match (user, password) {
            (Some(user), Some(password)) => Ok(Self { user, password }),
            _ => Err(EngineError::Config(
                "Credentials file has no [client] user and password".to_string(),
            )),
        }
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['\'', '"'] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
