use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;

fn harden_secret_file_permissions(path: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub rooms: RoomsConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
        }
    }
}

/// Backing store. No URL means in-process, single-instance operation.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    pub token_secret: String,
    #[serde(default = "default_token_expiry")]
    pub token_expiry_seconds: u64,
    /// Key of the stable unique identifier inside each token's bag.
    #[serde(default = "default_stable_key")]
    pub stable_identifier_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: generate_random_hex(64),
            token_expiry_seconds: default_token_expiry(),
            stable_identifier_key: default_stable_key(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PresenceConfig {
    #[serde(default = "default_presence_ttl")]
    pub ttl_seconds: u64,
    /// Must stay well below the TTL.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_identify_timeout")]
    pub identify_timeout_seconds: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_presence_ttl(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            identify_timeout_seconds: default_identify_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RoomsConfig {
    #[serde(default = "default_room_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_true")]
    pub auto_create: bool,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_room_ttl(),
            auto_create: true,
        }
    }
}

fn default_token_expiry() -> u64 {
    86_400
}
fn default_stable_key() -> String {
    "id".into()
}
fn default_presence_ttl() -> u64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    20
}
fn default_identify_timeout() -> u64 {
    30
}
fn default_room_ttl() -> u64 {
    86_400
}
fn default_true() -> bool {
    true
}

/// Generate a cryptographically random hex string of the given length.
fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 { b'0' + idx } else { b'a' + idx - 10 })
        })
        .collect()
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("Config file not found at '{}', generating defaults...", path);
            let config = Config::default();

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, toml::to_string_pretty(&config)?)?;
            let _ = harden_secret_file_permissions(path);
            tracing::info!("Generated default config at '{}'", path);
            config
        };
        let _ = harden_secret_file_permissions(path);

        // Environment variable overrides
        if let Ok(value) = std::env::var("TETHER_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("TETHER_REDIS_URL") {
            config.store.redis_url = Some(value);
        }
        if let Ok(value) = std::env::var("TETHER_TOKEN_SECRET") {
            config.auth.token_secret = value;
        }

        Ok(config)
    }

    pub fn app_config(&self) -> tether_core::AppConfig {
        tether_core::AppConfig {
            stable_identifier_key: self.auth.stable_identifier_key.clone(),
            token_expiry_seconds: self.auth.token_expiry_seconds,
            presence_ttl_seconds: self.presence.ttl_seconds,
            heartbeat_interval_seconds: self.presence.heartbeat_interval_seconds,
            room_ttl_seconds: self.rooms.ttl_seconds,
            auto_create_rooms: self.rooms.auto_create,
            identify_timeout_seconds: self.presence.identify_timeout_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_generates_defaults_with_a_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");
        let path = path.to_str().unwrap();

        let config = Config::load(path).unwrap();
        assert_eq!(config.auth.token_secret.len(), 64);
        assert!(std::path::Path::new(path).exists());

        // A second load reads the same secret back.
        let reloaded = Config::load(path).unwrap();
        assert_eq!(reloaded.auth.token_secret, config.auth.token_secret);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");
        std::fs::write(
            &path,
            "[auth]\ntoken_secret = \"fixed\"\n\n[presence]\nttl_seconds = 90\n",
        )
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.auth.token_secret, "fixed");
        assert_eq!(config.presence.ttl_seconds, 90);
        assert_eq!(config.presence.heartbeat_interval_seconds, 20);
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert!(config.rooms.auto_create);
    }
}
