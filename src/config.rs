//! Configuration management for the upload server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::upload::MetadataSchema;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub uploads: UploadConfig,
    pub mounts: Vec<MountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix for `Location` headers, e.g. `https://uploads.example.com`
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
    /// Root directory used by [`StorageProvider::Local`]
    pub local_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    Local,
    Minio,
    R2,
    S3,
    B2,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL for durable sessions; `None` keeps sessions in memory
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Maximum declared upload length (`None` = unlimited)
    pub max_size: Option<u64>,
    /// Maximum PATCH body accepted in one request
    pub max_chunk_bytes: usize,
    /// Idle time after which an unfinished session is swept
    pub session_ttl_secs: u64,
    /// How long completed session records are kept for HEAD queries
    pub completed_retention_secs: u64,
    pub sweep_interval_secs: u64,
}

/// One mounted instance of the upload protocol
#[derive(Debug, Clone, Deserialize)]
pub struct MountConfig {
    /// Name listed by `GET /`
    pub name: String,
    /// Base path, e.g. `/files`
    pub path: String,
    /// Bucket (object store) or subdirectory of `local_root` (local)
    pub bucket: String,
    pub hooks: HookConfig,
    pub metadata: MetadataSchema,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookConfig {
    /// Accept any metadata; objects land at the bucket root
    Passthrough,
    /// Route objects under `<namespace_root>/<routing key>` and refuse
    /// namespaces that already hold objects
    RoutedNamespace {
        routing_key: String,
        namespace_root: String,
    },
}

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_CHUNK_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_COMPLETED_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: DEFAULT_PORT,
                public_url: None,
            },
            storage: StorageConfig {
                provider: StorageProvider::Local,
                endpoint: "http://localhost:9000".to_string(),
                access_key: String::new(),
                secret_key: String::new(),
                region: Some("us-east-1".to_string()),
                local_root: PathBuf::from("./data"),
            },
            database: DatabaseConfig { url: None },
            uploads: UploadConfig {
                max_size: None,
                max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
                session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
                completed_retention_secs: DEFAULT_COMPLETED_RETENTION_SECS,
                sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            },
            mounts: default_mounts("uploads".to_string(), "agent-inventory".to_string()),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let provider = match env::var("STORAGE_PROVIDER")
            .unwrap_or_else(|_| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "local" => StorageProvider::Local,
            "minio" => StorageProvider::Minio,
            "r2" => StorageProvider::R2,
            "s3" => StorageProvider::S3,
            "b2" => StorageProvider::B2,
            other => {
                return Err(ConfigError::Invalid {
                    var: "STORAGE_PROVIDER",
                    value: other.to_string(),
                })
            }
        };

        let storage = if provider == StorageProvider::Local {
            StorageConfig {
                provider,
                endpoint: String::new(),
                access_key: String::new(),
                secret_key: String::new(),
                region: None,
                local_root: env::var("LOCAL_STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./data")),
            }
        } else {
            StorageConfig {
                provider,
                endpoint: required("S3_ENDPOINT")?,
                access_key: required("S3_ACCESS_KEY")?,
                secret_key: required("S3_SECRET_KEY")?,
                region: env::var("S3_REGION").ok(),
                local_root: PathBuf::from("./data"),
            }
        };

        let port = match env::var("PORT").or_else(|_| env::var("SERVER_PORT")) {
            Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: "PORT",
                value,
            })?,
            Err(_) => DEFAULT_PORT,
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port,
                public_url: env::var("PUBLIC_BASE_URL")
                    .ok()
                    .map(|url| url.trim_end_matches('/').to_string()),
            },
            storage,
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").ok(),
            },
            uploads: UploadConfig {
                max_size: optional_number("UPLOAD_MAX_SIZE")?,
                max_chunk_bytes: optional_number("UPLOAD_MAX_CHUNK_BYTES")?
                    .unwrap_or(DEFAULT_MAX_CHUNK_BYTES),
                session_ttl_secs: optional_number("UPLOAD_SESSION_TTL_SECS")?
                    .unwrap_or(DEFAULT_SESSION_TTL_SECS),
                completed_retention_secs: optional_number("UPLOAD_COMPLETED_RETENTION_SECS")?
                    .unwrap_or(DEFAULT_COMPLETED_RETENTION_SECS),
                sweep_interval_secs: optional_number("UPLOAD_SWEEP_INTERVAL_SECS")?
                    .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            },
            mounts: default_mounts(
                env::var("UPLOAD_BUCKET").unwrap_or_else(|_| "uploads".to_string()),
                env::var("AGENT_INVENTORY_BUCKET")
                    .unwrap_or_else(|_| "agent-inventory".to_string()),
            ),
        })
    }

    /// Idle TTL as a chrono duration
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.uploads.session_ttl_secs as i64)
    }

    pub fn completed_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.uploads.completed_retention_secs as i64)
    }
}

/// The two mounts of the standard deployment: a general upload endpoint and
/// the agent inventory endpoint routed by `propertyId`.
fn default_mounts(upload_bucket: String, inventory_bucket: String) -> Vec<MountConfig> {
    vec![
        MountConfig {
            name: "upload".to_string(),
            path: "/files".to_string(),
            bucket: upload_bucket,
            hooks: HookConfig::Passthrough,
            metadata: MetadataSchema::permissive(),
        },
        MountConfig {
            name: "agentInventoryUpload".to_string(),
            path: "/agentInventoryUpload".to_string(),
            bucket: inventory_bucket,
            hooks: HookConfig::RoutedNamespace {
                routing_key: "propertyId".to_string(),
                namespace_root: "media-files".to_string(),
            },
            metadata: MetadataSchema::permissive().with_routing_key("propertyId"),
        },
    ]
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::Missing(var))
}

fn optional_number<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mounts() {
        let config = Config::default();
        assert_eq!(config.mounts.len(), 2);
        assert_eq!(config.mounts[0].path, "/files");
        assert!(matches!(config.mounts[0].hooks, HookConfig::Passthrough));

        let inventory = &config.mounts[1];
        assert_eq!(inventory.path, "/agentInventoryUpload");
        assert_eq!(inventory.metadata.routing_key.as_deref(), Some("propertyId"));
        match &inventory.hooks {
            HookConfig::RoutedNamespace { routing_key, namespace_root } => {
                assert_eq!(routing_key, "propertyId");
                assert_eq!(namespace_root, "media-files");
            }
            other => panic!("unexpected hooks: {:?}", other),
        }
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        assert_eq!(config.session_ttl(), chrono::Duration::hours(24));
        assert_eq!(config.completed_retention(), chrono::Duration::days(7));
    }
}
