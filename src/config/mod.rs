use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration, loaded entirely from the environment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub models: ModelConfig,
    pub detection: DetectionConfig,
    pub webrtc: WebRtcConfig,
    pub security: SecurityConfig,
    pub telegram: TelegramConfig,
    pub storage: StorageConfig,
}

/// API server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// `development` allows wildcard CORS origins; `production` restricts
    /// to `allowed_origins`.
    pub environment: String,
    /// Comma-separated CORS allow-list, honored in production.
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,
    /// Connection pool max size
    pub max_connections: u32,
}

/// Model artifact configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Person detector weights (YOLO family, ONNX)
    pub yolo_model_path: PathBuf,
    /// Pose estimator weights (YOLO pose, ONNX)
    pub pose_model_path: PathBuf,
    /// Anomaly classifier weights (normalizing flow over pose sequences, ONNX)
    pub anomaly_model_path: PathBuf,
    /// Inference device tag ("cpu", "cuda:0", ...)
    pub device: String,
    /// Size of the bounded inference worker pool
    pub inference_workers: usize,
}

/// Detection pipeline tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectionConfig {
    /// Minimum person-detection confidence
    pub person_confidence: f32,
    /// Decision cut on the classifier score; scores below it are abnormal
    pub anomaly_threshold: f32,
    /// |score| at or above this is HIGH confidence
    pub high_cut: f32,
    /// |score| at or above this (and below high_cut) is MEDIUM confidence
    pub medium_cut: f32,
    /// Pose sequence length fed to the classifier
    pub sequence_length: usize,
    /// Frames a track survives without a matching detection
    pub tracker_max_age: u32,
    /// IoU threshold for detection/track association
    pub tracker_iou_threshold: f32,
}

/// WebRTC configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebRtcConfig {
    /// STUN server URLs used for every peer connection
    pub stun_servers: Vec<String>,
    /// Overall deadline for offer handling, seconds
    pub offer_timeout_secs: u64,
}

/// Security configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// HMAC secret for bearer-token verification
    pub jwt_secret: String,
}

/// Optional Telegram sink configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    /// Bot token; the sink and polling loop are disabled when unset
    pub bot_token: Option<String>,
}

/// Evidence storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root directory for anomaly evidence frames
    pub anomaly_frames_dir: PathBuf,
}

/// Helper to get environment variables with defaults
fn get_env_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|val| val.parse::<T>().ok())
        .unwrap_or(default)
}

fn get_env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn default_db_url() -> String {
    let host = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_else(|_| "postgres".to_string());
    let db = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "shopguard".to_string());

    format!("postgres://{}:{}@{}:{}/{}", user, password, host, port, db)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from the environment, filling defaults for
    /// anything unset.
    pub fn from_env() -> Self {
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .map(|raw| parse_list(&raw))
            .unwrap_or_default();

        let stun_servers = std::env::var("STUN_SERVERS")
            .map(|raw| parse_list(&raw))
            .unwrap_or_else(|_| {
                vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ]
            });

        Self {
            server: ServerConfig {
                host: get_env_str("SERVER_HOST", "0.0.0.0"),
                port: get_env_var("SERVER_PORT", 8000),
                environment: get_env_str("ENVIRONMENT", "development").to_lowercase(),
                allowed_origins,
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL").unwrap_or_else(|_| default_db_url()),
                max_connections: get_env_var("DATABASE_MAX_CONNECTIONS", 10),
            },
            models: ModelConfig {
                yolo_model_path: PathBuf::from(get_env_str(
                    "YOLO_MODEL_PATH",
                    "./models/yolov8n.onnx",
                )),
                pose_model_path: PathBuf::from(get_env_str(
                    "POSE_MODEL_PATH",
                    "./models/yolov8n-pose.onnx",
                )),
                anomaly_model_path: PathBuf::from(get_env_str(
                    "ANOMALY_MODEL_PATH",
                    "./models/stg_nf_trained.onnx",
                )),
                device: get_env_str("DEVICE", "cpu"),
                inference_workers: get_env_var("INFERENCE_WORKERS", 2),
            },
            detection: DetectionConfig {
                person_confidence: get_env_var("PERSON_DETECTION_CONFIDENCE", 0.45),
                anomaly_threshold: get_env_var("ANOMALY_THRESHOLD", 0.0),
                high_cut: get_env_var("ANOMALY_HIGH_CUT", 3.0),
                medium_cut: get_env_var("ANOMALY_MEDIUM_CUT", 2.0),
                sequence_length: get_env_var("SEQUENCE_LENGTH", 24),
                tracker_max_age: get_env_var("TRACKER_MAX_AGE", 30),
                tracker_iou_threshold: get_env_var("TRACKER_IOU_THRESHOLD", 0.3),
            },
            webrtc: WebRtcConfig {
                stun_servers,
                offer_timeout_secs: get_env_var("OFFER_TIMEOUT_SECS", 10),
            },
            security: SecurityConfig {
                jwt_secret: get_env_str("JWT_SECRET", "change_me_in_production"),
            },
            telegram: TelegramConfig {
                bot_token: std::env::var("TELEGRAM_BOT_TOKEN")
                    .ok()
                    .filter(|t| !t.is_empty()),
            },
            storage: StorageConfig {
                anomaly_frames_dir: PathBuf::from(get_env_str(
                    "ANOMALY_FRAMES_DIR",
                    "./anomaly_frames",
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_splits_and_trims() {
        let parsed = parse_list("https://a.example, https://b.example ,");
        assert_eq!(parsed, vec!["https://a.example", "https://b.example"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn env_var_fallbacks() {
        assert_eq!(get_env_var("SHOPGUARD_TEST_UNSET_PORT", 8000u16), 8000);
        assert_eq!(get_env_str("SHOPGUARD_TEST_UNSET_HOST", "0.0.0.0"), "0.0.0.0");
    }

    #[test]
    fn environment_gates_cors() {
        let mut server = ServerConfig {
            host: "0.0.0.0".into(),
            port: 8000,
            environment: "development".into(),
            allowed_origins: vec![],
        };
        assert!(server.is_development());
        server.environment = "production".into();
        assert!(!server.is_development());
    }
}
