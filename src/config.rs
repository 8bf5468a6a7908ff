//! Runtime settings for the proof service, read once at startup.
use std::collections::BTreeMap;
use std::time::Duration;
use std::{fs::File, io::Read, path::Path};

use serde::{Deserialize, Serialize};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
const MAX_TIME_SPAN_MILLIS: u64 = 24 * 60 * 60 * 1000;
const MAX_FRESHNESS_WINDOW_DAYS: u64 = 100 * 365;
const MAX_SERVICE_TOKEN_VALIDITY_SECS: u64 = 366 * SECONDS_PER_DAY;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Scenario used when the connection type has no dedicated one.
    pub default_scenario: String,
    pub scenario_by_connection_type: BTreeMap<String, String>,
    pub scenario_version: String,
    /// Time the client has to answer a dispatched scenario.
    pub time_span_millis: u64,
    /// Maximum age of a cached proof before it is evicted.
    pub freshness_window_days: u64,
    pub service_token_validity_secs: u64,
    pub signing_key_alias: String,
    pub token_type: String,
    pub proof_method: String,
    pub actor_id: Option<String>,
    pub actor_profession_oid: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_scenario: "default".to_string(),
            scenario_by_connection_type: BTreeMap::new(),
            scenario_version: "1.0.0".to_string(),
            time_span_millis: 10_000,
            freshness_window_days: 90,
            service_token_validity_secs: 300,
            signing_key_alias: "popp-signer".to_string(),
            token_type: "vnd.telematik.popp+jwt".to_string(),
            proof_method: "ehc-practitioner-trustedchannel".to_string(),
            actor_id: None,
            actor_profession_oid: None,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        if !value.is_object() {
            return Err(Error::Invalid("configuration must be a JSON object"));
        }
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut json = String::new();
        File::open(path)?.read_to_string(&mut json)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(1..=MAX_TIME_SPAN_MILLIS).contains(&self.time_span_millis) {
            return Err(Error::Invalid("timeSpanMillis must be between 1 and one day"));
        }
        if !(1..=MAX_FRESHNESS_WINDOW_DAYS).contains(&self.freshness_window_days) {
            return Err(Error::Invalid(
                "freshnessWindowDays must be between 1 and 100 years",
            ));
        }
        if !(1..=MAX_SERVICE_TOKEN_VALIDITY_SECS).contains(&self.service_token_validity_secs) {
            return Err(Error::Invalid(
                "serviceTokenValiditySecs must be between 1 and one year",
            ));
        }
        if self.default_scenario.is_empty() {
            return Err(Error::Invalid("defaultScenario must not be empty"));
        }
        Ok(())
    }

    /// Scenario name for a card connection type.
    pub fn scenario_for(&self, card_connection_type: &str) -> &str {
        self.scenario_by_connection_type
            .get(card_connection_type)
            .unwrap_or(&self.default_scenario)
    }

    pub fn time_span(&self) -> Duration {
        Duration::from_millis(self.time_span_millis)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_days * SECONDS_PER_DAY)
    }

    pub fn service_token_validity(&self) -> Duration {
        Duration::from_secs(self.service_token_validity_secs)
    }
}
