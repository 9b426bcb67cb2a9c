// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection string parsing.
//!
//! Turns a single connection string into a [`ConnectionDescriptor`]. Pure,
//! no I/O. Accepted shapes:
//!
//! ```text
//! [scheme]://[user[:password]@]host[:port][/database]
//! host[:port][/database]
//! ```
//!
//! Userinfo may be percent-encoded and is decoded; everything up to the
//! last `@` is userinfo.
//!
//! A missing scheme defaults to plain `http`; a missing port defaults to the
//! store's conventional port for the scheme (5984 for `http`, 6984 for `https`).
//! An empty string is a configuration error, never a connection attempt.

use crate::error::{BusError, Result};
use std::fmt;
use std::str::FromStr;

/// Transport scheme of the store endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            _ => None,
        }
    }

    /// Conventional store port for this scheme.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 5984,
            Scheme::Https => 6984,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured connection parameters.
///
/// Built once from configuration and never mutated; reconfiguration
/// produces a new descriptor. `Debug` and `Display` redact the password.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    /// Database path segment, without surrounding slashes. May be empty.
    pub database: String,
}

impl ConnectionDescriptor {
    /// Parse a connection string.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(BusError::Config("connection string is empty".to_string()));
        }

        let (scheme, rest) = match input.find("://") {
            Some(idx) => {
                let raw = &input[..idx];
                let scheme = if raw.is_empty() {
                    Scheme::default()
                } else {
                    Scheme::from_name(raw).ok_or_else(|| {
                        BusError::Config(format!("unsupported scheme '{}'", raw))
                    })?
                };
                (scheme, &input[idx + 3..])
            }
            None => (Scheme::default(), input),
        };

        // Userinfo ends at the last '@', so passwords may hold '/', '?' and '#'
        let (userinfo, rest) = match rest.rfind('@') {
            Some(idx) => (Some(&rest[..idx]), &rest[idx + 1..]),
            None => (None, rest),
        };

        // Query strings and fragments carry nothing we use
        let rest = match rest.find(['?', '#']) {
            Some(idx) => &rest[..idx],
            None => rest,
        };

        let (host_port, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => (rest, ""),
        };

        let (user, password) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((user, password)) => (
                    non_empty(&percent_decode("user", user)?),
                    Some(percent_decode("password", password)?),
                ),
                None => (non_empty(&percent_decode("user", info)?), None),
            },
            None => (None, None),
        };

        let (host, port) = split_host_port(host_port)?;
        if host.is_empty() {
            return Err(BusError::Config(format!(
                "connection string '{}' has no host",
                redact_userinfo(input)
            )));
        }

        let port = match port {
            Some(p) if !p.is_empty() => match p.parse::<u16>() {
                Ok(0) | Err(_) => {
                    return Err(BusError::Config(format!("invalid port '{}'", p)));
                }
                Ok(port) => port,
            },
            _ => scheme.default_port(),
        };

        Ok(Self {
            scheme,
            user,
            password,
            host: host.to_string(),
            port,
            database: path.trim_matches('/').to_string(),
        })
    }

    /// `scheme://host:port`, without credentials.
    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        }
    }

    /// Base URL plus the (escaped) database segment.
    pub fn database_url(&self) -> String {
        format!("{}/{}", self.base_url(), self.database.replace('/', "%2F"))
    }

    pub fn has_credentials(&self) -> bool {
        self.user.is_some()
    }

    /// Copy with a different database path.
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..self.clone()
        }
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(ref user) = self.user {
            write!(f, "{}", user)?;
            if self.password.is_some() {
                write!(f, ":***")?;
            }
            write!(f, "@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        write!(f, ":{}/{}", self.port, self.database)
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("scheme", &self.scheme)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Decode `%XX` escapes in a userinfo component.
fn percent_decode(field: &str, raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| BusError::Config(format!("{} is not valid UTF-8 once percent-decoded", field)))
}

/// Split `host[:port]`, handling bracketed IPv6 literals.
fn split_host_port(s: &str) -> Result<(&str, Option<&str>)> {
    if let Some(stripped) = s.strip_prefix('[') {
        let end = stripped
            .find(']')
            .ok_or_else(|| BusError::Config(format!("unterminated IPv6 host '{}'", s)))?;
        let host = &stripped[..end];
        let after = &stripped[end + 1..];
        if after.is_empty() {
            return Ok((host, None));
        }
        return match after.strip_prefix(':') {
            Some(port) => Ok((host, Some(port))),
            None => Err(BusError::Config(format!("unexpected '{}' after IPv6 host", after))),
        };
    }

    Ok(match s.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (s, None),
    })
}

/// Hide userinfo when echoing a connection string in an error.
fn redact_userinfo(input: &str) -> String {
    match (input.find("://"), input.rfind('@')) {
        (Some(start), Some(at)) if at > start => {
            format!("{}://***{}", &input[..start], &input[at..])
        }
        (None, Some(at)) => format!("***{}", &input[at..]),
        _ => input.to_string(),
    }
}
