use crate::parse_url;
use std::{env, time::Duration};
use url::Url;

/// Environment variable naming the outbound OTLP endpoint. Required.
pub const OTLP_ENDPOINT_VAR: &str = "OTLP_ENDPOINT";
/// Alternate name for the outbound endpoint, checked second.
pub const OTLP_ENDPOINT_ALT_VAR: &str = "SWI_OTEL_ENDPOINT";
/// Environment variable holding the bearer token. Required.
pub const API_TOKEN_VAR: &str = "API_TOKEN";
/// Alternate name for the bearer token, checked second.
pub const API_TOKEN_ALT_VAR: &str = "SWI_API_KEY";
/// When set to "yes" and running in the managed environment, the endpoint
/// and token values are treated as base64-wrapped KMS ciphertexts.
pub const USE_ENCRYPTION_VAR: &str = "USE_ENCRYPTION";
/// Presence of this variable marks execution in the managed environment.
pub const MANAGED_ENVIRONMENT_VAR: &str = "AWS_LAMBDA_INITIALIZATION_TYPE";
/// Region to fall back to when no record-level region could be parsed.
pub const AWS_REGION_VAR: &str = "AWS_REGION";
/// Log group whose deliveries are processed as VPC flow logs.
pub const VPC_LOG_GROUP_VAR: &str = "VPC_LOG_GROUP_NAME";
/// "DEBUG" enables verbose logging in the flow log pipeline.
pub const LOG_LEVEL_VAR: &str = "LOG_LEVEL";
/// Every Nth flow log record also logs its full OTLP JSON rendering.
pub const VPC_DEBUG_INTERVAL_VAR: &str = "VPC_DEBUG_INTERVAL";
/// TTL of the flow log format cache, in whole minutes.
pub const VPC_FLOW_LOG_CACHE_TTL_VAR: &str = "VPC_FLOW_LOG_CACHE_TTL_MINUTES";

const DEFAULT_DEBUG_INTERVAL: u64 = 100;
const DEFAULT_CACHE_TTL_MINUTES: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no outbound endpoint configured (set {OTLP_ENDPOINT_VAR} or {OTLP_ENDPOINT_ALT_VAR})")]
    MissingEndpoint,
    #[error("outbound endpoint is not a valid URL: {0}")]
    InvalidEndpoint(String),
    #[error("no API token configured (set {API_TOKEN_VAR} or {API_TOKEN_ALT_VAR})")]
    MissingToken,
}

/// Configuration resolved from the process environment at startup. The
/// endpoint and token may still be ciphertexts at this stage; see
/// [`crate::secrets`] for the decryption step.
#[derive(Debug, Clone)]
pub struct Config {
    /// The raw endpoint string as found in the environment. Kept as a string
    /// until secrets are resolved, because under encryption it is a base64
    /// ciphertext rather than a URL.
    pub endpoint: String,
    /// The raw bearer token (or its ciphertext) as found in the environment.
    pub api_token: String,
    /// Whether endpoint and token must be KMS-decrypted before use.
    pub use_encryption: bool,
    /// Whether the process is executing in the managed environment. Secret
    /// decryption is only attempted there.
    pub managed_environment: bool,
    /// Region fallback for records that carry no parseable region.
    pub region_fallback: Option<String>,
    /// Deliveries from this log group are handled by the flow log pipeline.
    pub vpc_log_group: Option<String>,
    /// Verbose logging in the flow log pipeline.
    pub verbose: bool,
    /// Every Nth flow log record also logs its full OTLP JSON rendering.
    pub debug_interval: u64,
    /// TTL for cached flow log format strings.
    pub flow_log_cache_ttl: Duration,
}

impl Config {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Config, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads configuration through the provided lookup function. Split out
    /// from `from_env` so tests do not have to mutate process-global state.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first_of = |primary: &str, alternate: &str| {
            lookup(primary)
                .filter(|v| !v.is_empty())
                .or_else(|| lookup(alternate).filter(|v| !v.is_empty()))
        };

        let endpoint = first_of(OTLP_ENDPOINT_VAR, OTLP_ENDPOINT_ALT_VAR)
            .ok_or(ConfigError::MissingEndpoint)?;
        let api_token =
            first_of(API_TOKEN_VAR, API_TOKEN_ALT_VAR).ok_or(ConfigError::MissingToken)?;

        let use_encryption = lookup(USE_ENCRYPTION_VAR)
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        let managed_environment = lookup(MANAGED_ENVIRONMENT_VAR).is_some();

        let verbose = lookup(LOG_LEVEL_VAR)
            .map(|v| v.eq_ignore_ascii_case("debug"))
            .unwrap_or(false);

        // Out-of-range or unparseable intervals fall back to the default
        // rather than failing startup.
        let debug_interval = lookup(VPC_DEBUG_INTERVAL_VAR)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|n| (1..=10_000).contains(n))
            .unwrap_or(DEFAULT_DEBUG_INTERVAL);

        let ttl_minutes = lookup(VPC_FLOW_LOG_CACHE_TTL_VAR)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_CACHE_TTL_MINUTES);

        Ok(Config {
            endpoint,
            api_token,
            use_encryption,
            managed_environment,
            region_fallback: lookup(AWS_REGION_VAR).filter(|v| !v.is_empty()),
            vpc_log_group: lookup(VPC_LOG_GROUP_VAR).filter(|v| !v.is_empty()),
            verbose,
            debug_interval,
            flow_log_cache_ttl: Duration::from_secs(ttl_minutes * 60),
        })
    }

    /// Whether the provided log group should be processed as VPC flow logs.
    pub fn is_flow_log_group(&self, log_group: &str) -> bool {
        self.vpc_log_group.as_deref() == Some(log_group)
    }

    /// Parses the (decrypted) endpoint string into a URL.
    pub fn endpoint_url(endpoint: &str) -> Result<Url, ConfigError> {
        parse_url(endpoint.to_owned()).map_err(|_| ConfigError::InvalidEndpoint(endpoint.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn minimal_configuration() {
        let config = Config::from_lookup(lookup_from(&[
            ("OTLP_ENDPOINT", "https://otel.example.com"),
            ("API_TOKEN", "token-1"),
        ]))
        .unwrap();

        assert_eq!(config.endpoint, "https://otel.example.com");
        assert_eq!(config.api_token, "token-1");
        assert!(!config.use_encryption);
        assert!(!config.managed_environment);
        assert_eq!(config.debug_interval, 100);
        assert_eq!(config.flow_log_cache_ttl, Duration::from_secs(600));
        assert_eq!(config.vpc_log_group, None);
    }

    #[test]
    fn alternate_variable_names() {
        let config = Config::from_lookup(lookup_from(&[
            ("SWI_OTEL_ENDPOINT", "https://otel.example.com"),
            ("SWI_API_KEY", "token-2"),
        ]))
        .unwrap();
        assert_eq!(config.api_token, "token-2");
    }

    #[test]
    fn primary_name_wins_over_alternate() {
        let config = Config::from_lookup(lookup_from(&[
            ("OTLP_ENDPOINT", "https://primary.example.com"),
            ("SWI_OTEL_ENDPOINT", "https://alternate.example.com"),
            ("API_TOKEN", "token"),
        ]))
        .unwrap();
        assert_eq!(config.endpoint, "https://primary.example.com");
    }

    #[test]
    fn missing_required_values() {
        let e = Config::from_lookup(lookup_from(&[("API_TOKEN", "t")])).unwrap_err();
        assert_matches!(e, ConfigError::MissingEndpoint);

        let e = Config::from_lookup(lookup_from(&[("OTLP_ENDPOINT", "https://x.example.com")]))
            .unwrap_err();
        assert_matches!(e, ConfigError::MissingToken);
    }

    #[test]
    fn debug_interval_bounds() {
        let base = [
            ("OTLP_ENDPOINT", "https://x.example.com"),
            ("API_TOKEN", "t"),
        ];

        for (value, expected) in [
            ("50", 50),
            ("1", 1),
            ("10000", 10_000),
            ("0", 100),
            ("10001", 100),
            ("garbage", 100),
            ("-5", 100),
        ] {
            let mut pairs = base.to_vec();
            pairs.push(("VPC_DEBUG_INTERVAL", value));
            let config = Config::from_lookup(lookup_from(&pairs)).unwrap();
            assert_eq!(config.debug_interval, expected, "interval {value}");
        }
    }

    #[test]
    fn cache_ttl_minutes() {
        let config = Config::from_lookup(lookup_from(&[
            ("OTLP_ENDPOINT", "https://x.example.com"),
            ("API_TOKEN", "t"),
            ("VPC_FLOW_LOG_CACHE_TTL_MINUTES", "3"),
        ]))
        .unwrap();
        assert_eq!(config.flow_log_cache_ttl, Duration::from_secs(180));
    }

    #[test]
    fn encryption_flags() {
        let config = Config::from_lookup(lookup_from(&[
            ("OTLP_ENDPOINT", "https://x.example.com"),
            ("API_TOKEN", "t"),
            ("USE_ENCRYPTION", "yes"),
            ("AWS_LAMBDA_INITIALIZATION_TYPE", "on-demand"),
        ]))
        .unwrap();
        assert!(config.use_encryption);
        assert!(config.managed_environment);
    }

    #[test]
    fn flow_log_group_selection() {
        let config = Config::from_lookup(lookup_from(&[
            ("OTLP_ENDPOINT", "https://x.example.com"),
            ("API_TOKEN", "t"),
            ("VPC_LOG_GROUP_NAME", "vpc-flow-logs"),
        ]))
        .unwrap();
        assert!(config.is_flow_log_group("vpc-flow-logs"));
        assert!(!config.is_flow_log_group("/aws/eks/app"));
    }
}
