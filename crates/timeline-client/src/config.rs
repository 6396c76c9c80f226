//! Environment-backed configuration for the room drivers.

use std::env;

use thiserror::Error;
use timeline_core::Timeline;

const DEFAULT_PAGINATE_LIMIT: u16 = 30;
const DEFAULT_PAGINATION_LIMIT_CAP: u16 = 100;
const DEFAULT_NOTIFICATION_BUFFER: usize = 512;

/// Runtime configuration shared by every room of a [`crate::Client`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Local user ID, used as sender of local echoes.
    pub user_id: String,
    /// Scrollback page size used when the caller does not pass one.
    pub paginate_limit: u16,
    /// Largest page the server is asked for.
    pub pagination_limit_cap: u16,
    /// Capacity of the notification broadcast channel.
    pub notification_buffer: usize,
}

impl ClientConfig {
    /// Configuration with default tuning for `user_id`.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            paginate_limit: DEFAULT_PAGINATE_LIMIT,
            pagination_limit_cap: DEFAULT_PAGINATION_LIMIT_CAP,
            notification_buffer: DEFAULT_NOTIFICATION_BUFFER,
        }
    }

    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let user_id = optional_trimmed_env("TIMELINE_USER_ID", &mut lookup)
            .ok_or(ConfigError::Missing("TIMELINE_USER_ID"))?;
        let paginate_limit =
            parse_with_default("TIMELINE_PAGINATE_LIMIT", DEFAULT_PAGINATE_LIMIT, &mut lookup)?;
        let pagination_limit_cap = parse_with_default(
            "TIMELINE_PAGINATION_LIMIT_CAP",
            DEFAULT_PAGINATION_LIMIT_CAP,
            &mut lookup,
        )?;
        let notification_buffer = parse_with_default(
            "TIMELINE_NOTIFICATION_BUFFER",
            DEFAULT_NOTIFICATION_BUFFER,
            &mut lookup,
        )?;

        if paginate_limit == 0 {
            return Err(at_least_one("TIMELINE_PAGINATE_LIMIT"));
        }
        if pagination_limit_cap == 0 {
            return Err(at_least_one("TIMELINE_PAGINATION_LIMIT_CAP"));
        }
        if notification_buffer == 0 {
            return Err(at_least_one("TIMELINE_NOTIFICATION_BUFFER"));
        }

        Ok(Self {
            user_id,
            paginate_limit,
            pagination_limit_cap,
            notification_buffer,
        })
    }

    /// Effective scrollback page size for a request.
    pub fn scrollback_limit(&self, requested: Option<u16>) -> u16 {
        Timeline::bounded_paginate_limit(
            requested.unwrap_or(self.paginate_limit),
            self.pagination_limit_cap,
        )
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required environment variable is not set.
    #[error("missing required {0}")]
    Missing(&'static str),
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn at_least_one(key: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: "0".to_owned(),
        reason: "must be at least 1".to_owned(),
    }
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}
