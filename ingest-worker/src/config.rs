use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3000")]
    pub port: u16,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(nested = true)]
    pub sqs: SqsConfig,

    #[envconfig(nested = true)]
    pub influx: InfluxConfig,

    #[envconfig(nested = true)]
    pub dedup: DedupConfig,

    #[envconfig(nested = true)]
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct SqsConfig {
    #[envconfig(from = "SQS_PATH")]
    pub queue_url: NonEmptyString,

    #[envconfig(from = "AWS_REGION", default = "ap-southeast-1")]
    pub region: String,

    /// Static credentials. When unset the default AWS provider chain is used.
    #[envconfig(from = "AWS_KEY")]
    pub access_key: Option<String>,

    #[envconfig(from = "AWS_SECRET_KEY")]
    pub secret_key: Option<String>,

    /// Override of the SQS endpoint, e.g. for a local emulator.
    #[envconfig(from = "SQS_ENDPOINT")]
    pub endpoint: Option<String>,
}

impl SqsConfig {
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.access_key, &self.secret_key) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some((key.clone(), secret.clone()))
            }
            _ => None,
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct InfluxConfig {
    #[envconfig(from = "INFLUX_URL", default = "http://localhost:8086")]
    pub url: String,

    #[envconfig(from = "INFLUX_ORG")]
    pub org: NonEmptyString,

    #[envconfig(from = "INFLUX_BUCKET")]
    pub bucket: NonEmptyString,

    #[envconfig(from = "INFLUX_TOKEN")]
    pub token: NonEmptyString,

    #[envconfig(from = "INFLUX_REQUEST_TIMEOUT", default = "10000")]
    pub request_timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct DedupConfig {
    #[envconfig(from = "DEDUP_ENABLED", default = "true")]
    pub enabled: bool,

    #[envconfig(from = "REDIS_URL", default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(from = "DEDUP_KEY_PREFIX", default = "telemetry:processed:")]
    pub key_prefix: NonEmptyString,

    #[envconfig(from = "DEDUP_TTL_SECS", default = "3600")]
    pub ttl_secs: u64,

    #[envconfig(from = "REDIS_TIMEOUT", default = "1000")]
    pub command_timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct PipelineConfig {
    #[envconfig(from = "MEASUREMENT", default = "temperature")]
    pub measurement: NonEmptyString,

    #[envconfig(from = "POLL_WORKERS", default = "30")]
    pub poll_workers: usize,

    #[envconfig(from = "MAX_MESSAGES", default = "10")]
    pub max_messages: i32,

    #[envconfig(from = "WAIT_TIME_SECS", default = "5")]
    pub wait_time_secs: i32,

    #[envconfig(from = "VISIBILITY_TIMEOUT_SECS", default = "30")]
    pub visibility_timeout_secs: i32,

    /// Pause between two cycles of the same worker.
    #[envconfig(from = "POLL_DELAY", default = "0")]
    pub poll_delay: EnvMsDuration,

    #[envconfig(from = "FLUSH_INTERVAL", default = "500")]
    pub flush_interval: EnvMsDuration,

    #[envconfig(from = "FLUSH_CHUNK_SIZE", default = "1000")]
    pub flush_chunk_size: usize,

    #[envconfig(from = "QUEUE_DEPTH_INTERVAL", default = "10000")]
    pub queue_depth_interval: EnvMsDuration,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn required() -> HashMap<String, String> {
        HashMap::from([
            (
                "SQS_PATH".to_owned(),
                "https://sqs.ap-southeast-1.amazonaws.com/1234/telemetry".to_owned(),
            ),
            ("INFLUX_ORG".to_owned(), "plant".to_owned()),
            ("INFLUX_BUCKET".to_owned(), "soltempbucket".to_owned()),
            ("INFLUX_TOKEN".to_owned(), "secret".to_owned()),
        ])
    }

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&required()).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3000");
        assert_eq!(config.sqs.region, "ap-southeast-1");
        assert!(config.sqs.credentials().is_none());
        assert!(config.dedup.enabled);
        assert_eq!(config.dedup.ttl_secs, 3600);
        assert_eq!(config.dedup.key_prefix.as_str(), "telemetry:processed:");
        assert_eq!(config.pipeline.poll_workers, 30);
        assert_eq!(config.pipeline.max_messages, 10);
        assert_eq!(config.pipeline.wait_time_secs, 5);
        assert_eq!(config.pipeline.visibility_timeout_secs, 30);
        assert_eq!(config.pipeline.poll_delay.0, time::Duration::ZERO);
        assert_eq!(
            config.pipeline.flush_interval.0,
            time::Duration::from_millis(500)
        );
        assert_eq!(config.pipeline.flush_chunk_size, 1000);
        assert_eq!(config.pipeline.measurement.as_str(), "temperature");
    }

    #[test]
    fn test_static_credentials_need_both_halves() {
        let mut env = required();
        env.insert("AWS_KEY".to_owned(), "AKIA".to_owned());
        let config = Config::init_from_hashmap(&env).unwrap();
        assert!(config.sqs.credentials().is_none());

        env.insert("AWS_SECRET_KEY".to_owned(), "shh".to_owned());
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(
            config.sqs.credentials(),
            Some(("AKIA".to_owned(), "shh".to_owned()))
        );
    }

    #[test]
    fn test_missing_queue_url_is_an_error() {
        let mut env = required();
        env.remove("SQS_PATH");
        assert!(Config::init_from_hashmap(&env).is_err());

        env.insert("SQS_PATH".to_owned(), String::new());
        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
