//! Environment configuration for the service. Every key has a default
//! except the upstream API address and credentials; the shipper stays
//! disabled until both Splunk settings are present.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use auditrex_core::collector::CollectorConfig;
use auditrex_core::shipper::{BackoffPolicy, ShipperConfig};
use auditrex_core::upstream::UpstreamConfig;

const DEFAULT_DATABASE_URL: &str = "postgres://postgres:@localhost:5432/";
const DEFAULT_PORT: u16 = 9299;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_DEPLOY_ENV: &str = "dev";

const DEFAULT_PAGINATION_WAIT_TIME: Duration = Duration::from_millis(200);
const DEFAULT_COLLECTOR_SCHEDULE: Duration = Duration::from_secs(2 * 60);
const DEFAULT_COLLECTOR_MIN_WAIT_TIME: Duration = Duration::from_secs(3);
const DEFAULT_COLLECTOR_INITIAL_WAIT_TIME: Duration = Duration::from_secs(5);
const DEFAULT_COLLECTOR_INITIAL_LOOKBACK: Duration = Duration::from_secs(28 * 24 * 60 * 60);
const DEFAULT_SHIPPER_SCHEDULE: Duration = Duration::from_secs(15);
const DEFAULT_INFORMER_SCHEDULE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub log_level: String,
    pub upstream: UpstreamConfig,
    pub pagination_wait_time: Duration,
    pub collector: CollectorConfig,
    pub informer_schedule: Duration,
    /// `None` when Splunk is not configured; the shipper is not started.
    pub shipper: Option<ShipperConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let Some(api_address) = get("CF_API_ADDRESS") else {
            bail!("CF_API_ADDRESS is required");
        };

        let upstream = UpstreamConfig {
            api_address,
            username: get("CF_USERNAME"),
            password: get("CF_PASSWORD"),
            client_id: get("CF_CLIENT_ID"),
            client_secret: get("CF_CLIENT_SECRET"),
            token: get("CF_TOKEN"),
            skip_ssl_validation: get("CF_SKIP_SSL_VALIDATION").as_deref() == Some("true"),
            user_agent: get("CF_USER_AGENT"),
        };

        let collector = CollectorConfig {
            schedule: duration_var(&get, "COLLECTOR_SCHEDULE", DEFAULT_COLLECTOR_SCHEDULE)?,
            min_wait_time: duration_var(
                &get,
                "COLLECTOR_MIN_WAIT_TIME",
                DEFAULT_COLLECTOR_MIN_WAIT_TIME,
            )?,
            initial_wait_time: duration_var(
                &get,
                "COLLECTOR_INITIAL_WAIT_TIME",
                DEFAULT_COLLECTOR_INITIAL_WAIT_TIME,
            )?,
            initial_lookback: duration_var(
                &get,
                "COLLECTOR_INITIAL_LOOKBACK",
                DEFAULT_COLLECTOR_INITIAL_LOOKBACK,
            )?,
        };

        let deploy_env = get("DEPLOY_ENV").unwrap_or_else(|| DEFAULT_DEPLOY_ENV.to_string());
        let shipper = match (get("SPLUNK_API_KEY"), get("SPLUNK_HEC_ENDPOINT_URL")) {
            (Some(api_key), Some(hec_endpoint_url)) => Some(ShipperConfig {
                schedule: duration_var(&get, "SHIPPER_SCHEDULE", DEFAULT_SHIPPER_SCHEDULE)?,
                deploy_env,
                api_key,
                hec_endpoint_url,
                backoff: BackoffPolicy::default(),
            }),
            _ => None,
        };

        let port = match get("PORT") {
            Some(raw) => raw.parse().with_context(|| format!("parsing PORT {raw:?}"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            port,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            upstream,
            pagination_wait_time: duration_var(
                &get,
                "FETCHER_PAGINATION_WAIT_TIME",
                DEFAULT_PAGINATION_WAIT_TIME,
            )?,
            collector,
            informer_schedule: duration_var(&get, "INFORMER_SCHEDULE", DEFAULT_INFORMER_SCHEDULE)?,
            shipper,
        })
    }
}

fn duration_var(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    match get(key) {
        Some(raw) => {
            humantime::parse_duration(&raw).with_context(|| format!("parsing {key} {raw:?}"))
        }
        None => Ok(default),
    }
}
