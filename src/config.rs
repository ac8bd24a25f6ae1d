use std::{env, fmt::Display, fs::read_to_string, path::PathBuf, str::FromStr};

use log::{info, warn};
use rand::RngCore;

use crate::error::AppError;

/// Connection details for the hosted backend-as-a-service.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub url: String,
    pub service_key: String,
}

/// VAPID identity used to sign web-push deliveries.
#[derive(Clone, Debug)]
pub struct VapidConfig {
    pub public_key: String,
    pub private_key: String,
    pub subject: String,
}

/// Runtime configuration, read from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub static_dir: PathBuf,
    pub remote: Option<RemoteConfig>,
    pub exercise_api_url: String,
    pub vapid: Option<VapidConfig>,
    pub session_hours: u64,
    pub signing_secret: Vec<u8>,
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        let remote = match (optional("SUPABASE_URL"), secret("SUPABASE_SERVICE_KEY")) {
            (Some(url), Some(service_key)) => Some(RemoteConfig {
                url: url.trim_end_matches('/').to_string(),
                service_key,
            }),
            (Some(_), None) => {
                return Err(AppError::Config(
                    "SUPABASE_URL is set but SUPABASE_SERVICE_KEY is missing".into(),
                ));
            }
            _ => None,
        };

        let vapid = match (optional("VAPID_PUBLIC_KEY"), secret("VAPID_PRIVATE_KEY")) {
            (Some(public_key), Some(private_key)) => Some(VapidConfig {
                public_key,
                private_key,
                subject: optional("VAPID_SUBJECT")
                    .unwrap_or_else(|| "mailto:admin@gymdesk.local".to_string()),
            }),
            _ => None,
        };

        let signing_secret = match secret("GYMDESK_SIGNING_SECRET") {
            Some(value) => value.into_bytes(),
            None => {
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                bytes
            }
        };

        Ok(Self {
            bind: try_load("GYMDESK_BIND", "127.0.0.1")?,
            port: try_load("GYMDESK_PORT", "3000")?,
            data_dir: try_load("GYMDESK_DATA_DIR", "database")?,
            static_dir: try_load("GYMDESK_STATIC_DIR", "static")?,
            remote,
            exercise_api_url: try_load::<String>("EXERCISE_API_URL", "https://wger.de")?
                .trim_end_matches('/')
                .to_string(),
            vapid,
            session_hours: try_load("GYMDESK_SESSION_HOURS", "24")?,
            signing_secret,
        })
    }

    /// Configuration for tests and local tooling: local backend under
    /// `data_dir`, no push identity.
    pub fn local(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 0,
            data_dir: data_dir.into(),
            static_dir: PathBuf::from("static"),
            remote: None,
            exercise_api_url: "https://wger.de".to_string(),
            vapid: None,
            session_hours: 24,
            signing_secret: b"local-signing-secret".to_vec(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T, AppError>
where
    T::Err: Display,
{
    optional(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| AppError::Config(format!("Invalid {key} value: {e}")))
}

/// Reads a secret from the environment, falling back to `/run/secrets/{name}`.
fn secret(name: &str) -> Option<String> {
    if let Some(value) = optional(name) {
        return Some(value);
    }

    let path = format!("/run/secrets/{name}");
    match read_to_string(&path) {
        Ok(value) => Some(value.trim().to_string()),
        Err(_) => {
            warn!("Secret {name} not found in environment or {path}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_config_has_no_remote_or_push() {
        let config = Config::local("/tmp/gymdesk");
        assert!(config.remote.is_none());
        assert!(config.vapid.is_none());
        assert_eq!(config.data_dir, PathBuf::from("/tmp/gymdesk"));
        assert_eq!(config.address(), "127.0.0.1:0");
    }

    #[test]
    fn try_load_falls_back_to_default() {
        let port: u16 = try_load("GYMDESK_TEST_UNSET_PORT_VARIABLE", "4321").unwrap();
        assert_eq!(port, 4321);
    }

    #[test]
    fn try_load_rejects_bad_default() {
        let result: Result<u16, _> = try_load("GYMDESK_TEST_UNSET_PORT_VARIABLE", "port");
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
