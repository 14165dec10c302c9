use std::time::Duration;

use url::Url;

pub const DEFAULT_DESTINATION_BASE: &str = "https://chat.whatsapp.com/";
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;
/// Anything shorter fails every DynamoDB round trip.
const MIN_STORE_TIMEOUT_MS: u64 = 50;
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Runtime settings, read from the environment once per cold start.
#[derive(Debug, Clone)]
pub struct Settings {
    pub table_links: String,
    pub links_slug_index: String,
    pub table_candidates: String,
    pub table_events: String,
    pub destination_base: Url,
    pub store_timeout: Duration,
    pub retry_after_secs: u64,
    pub reserve_on_allocate: bool,
    pub fingerprint_salt: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as `from_env` but with an injectable variable source.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            get(name)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let destination_base = match get("DESTINATION_BASE") {
            Some(v) => parse_base(&v)?,
            None => parse_base(DEFAULT_DESTINATION_BASE)?,
        };

        Ok(Self {
            table_links: required("TABLE_LINKS")?,
            links_slug_index: get("LINKS_SLUG_INDEX").unwrap_or_else(|| "GSI1-slug".to_string()),
            table_candidates: required("TABLE_CANDIDATES")?,
            table_events: required("TABLE_EVENTS")?,
            destination_base,
            store_timeout: parse_store_timeout(&get)?,
            retry_after_secs: parse_or(&get, "RETRY_AFTER_SECS", DEFAULT_RETRY_AFTER_SECS)?,
            reserve_on_allocate: parse_bool(&get, "RESERVE_ON_ALLOCATE")?,
            fingerprint_salt: get("FINGERPRINT_SALT").unwrap_or_default(),
        })
    }
}

fn parse_or<F>(get: &F, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid { name, value: v }),
    }
}

fn parse_store_timeout<F>(get: &F) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let ms = parse_or(get, "STORE_TIMEOUT_MS", DEFAULT_STORE_TIMEOUT_MS)?;
    if ms < MIN_STORE_TIMEOUT_MS {
        return Err(ConfigError::Invalid {
            name: "STORE_TIMEOUT_MS",
            value: ms.to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

fn parse_bool<F>(get: &F, name: &'static str) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(name).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            name,
            value: v.to_string(),
        }),
    }
}

fn parse_base(v: &str) -> Result<Url, ConfigError> {
    let invalid = || ConfigError::Invalid {
        name: "DESTINATION_BASE",
        value: v.to_string(),
    };
    let mut url = Url::parse(v).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
        return Err(invalid());
    }
    // Url::join drops the last segment unless the path ends in '/'
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
