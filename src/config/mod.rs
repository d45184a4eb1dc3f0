use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ProctorError, Result};

const DEFAULT_STUN_SERVERS: &str = "stun:stun1.l.google.com:19302,stun:stun2.l.google.com:19302";
const DEFAULT_QUESTION_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub webrtc: WebRtcConfig,
    pub proctoring: ProctoringConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

#[derive(Debug, Clone)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Timing knobs for the student-side timeline and the professor dashboard.
#[derive(Debug, Clone)]
pub struct ProctoringConfig {
    pub alert_duration: Duration,
    pub face_sample_interval: Duration,
    pub reconcile_interval: Duration,
    pub submit_retry_attempts: u32,
    pub submit_retry_delay: Duration,
    /// How often a timed or threshold submission the store rejected is retried.
    pub submit_recovery_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: split_list(DEFAULT_STUN_SERVERS),
            turn_servers: Vec::new(),
        }
    }
}

impl Default for ProctoringConfig {
    fn default() -> Self {
        Self {
            alert_duration: Duration::from_secs(3),
            face_sample_interval: Duration::from_secs(3),
            reconcile_interval: Duration::from_secs(30),
            submit_retry_attempts: 3,
            submit_retry_delay: Duration::from_millis(500),
            submit_recovery_interval: Duration::from_secs(10),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_QUESTION_API_URL.to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ProctorError::InvalidConfiguration("Invalid SERVER_PORT".to_string()))?;

        let mut turn_servers = vec![];
        if let (Ok(turn_url), Ok(username), Ok(credential)) = (
            env::var("TURN_SERVER_URL"),
            env::var("TURN_USERNAME"),
            env::var("TURN_CREDENTIAL"),
        ) {
            turn_servers.push(TurnServer {
                urls: vec![turn_url],
                username,
                credential,
            });
        }

        let defaults = ProctoringConfig::default();

        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port,
            },
            webrtc: WebRtcConfig {
                stun_servers: split_list(
                    &env::var("STUN_SERVER_URLS").unwrap_or_else(|_| DEFAULT_STUN_SERVERS.to_string()),
                ),
                turn_servers,
            },
            proctoring: ProctoringConfig {
                alert_duration: Duration::from_secs(env_or("ALERT_DURATION_SECS", 3)),
                face_sample_interval: Duration::from_secs(env_or("FACE_SAMPLE_INTERVAL_SECS", 3)),
                reconcile_interval: Duration::from_secs(env_or("RECONCILE_INTERVAL_SECS", 30)),
                submit_retry_attempts: env_or("SUBMIT_RETRY_ATTEMPTS", defaults.submit_retry_attempts),
                submit_retry_delay: Duration::from_millis(env_or("SUBMIT_RETRY_DELAY_MS", 500)),
                submit_recovery_interval: Duration::from_secs(env_or("SUBMIT_RECOVERY_INTERVAL_SECS", 10)),
            },
            generation: GenerationConfig {
                api_url: env::var("QUESTION_API_URL")
                    .unwrap_or_else(|_| DEFAULT_QUESTION_API_URL.to_string()),
                api_key: env::var("QUESTION_API_KEY").ok().filter(|k| !k.is_empty()),
                model: env::var("QUESTION_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            },
        })
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::new(0, 0, 0, 0);
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::new(127, 0, 0, 1),
            "" | "0.0.0.0" => Ipv4Addr::new(0, 0, 0, 0),
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::new(0, 0, 0, 0)
            }
        }
    }
}

fn env_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key = %key, value = %raw, default = %default, "Invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
