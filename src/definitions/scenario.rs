//! Scenarios: named, ordered scripts of card commands and the status words
//! each command is allowed to end with.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::definitions::apdu::{self, Command};

const DEFAULT_STATUS_WORD: &str = "9000";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("step '{step}' has an invalid command: {source}")]
    InvalidCommand {
        step: String,
        #[source]
        source: apdu::Error,
    },
    #[error("step '{step}' has an invalid status word '{word}'")]
    InvalidStatusWord { step: String, word: String },
    #[error("step '{0}' accepts no status word")]
    NoAcceptedStatusWords(String),
    #[error("scenario '{0}' has no steps")]
    Empty(String),
    #[error("could not read scenario definitions: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse scenario definitions: {0}")]
    Json(#[from] serde_json::Error),
}

/// One command of a scenario together with its acceptable outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "commandApdu")]
    pub command_hex: String,
    #[serde(
        rename = "expectedStatusWords",
        default = "default_status_words"
    )]
    pub accepted_status_words: Vec<String>,
}

fn default_status_words() -> Vec<String> {
    vec![DEFAULT_STATUS_WORD.to_string()]
}

impl Step {
    /// A step accepting only `9000`.
    pub fn new(name: impl Into<String>, command_hex: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command_hex: command_hex.into(),
            accepted_status_words: default_status_words(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Replace the accepted status words. An empty list falls back to `9000`.
    pub fn with_accepted_status_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        self.accepted_status_words = if words.is_empty() {
            default_status_words()
        } else {
            words
        };
        self
    }

    /// Case-insensitive membership in the accepted status words.
    pub fn is_status_word_expected(&self, word: &str) -> bool {
        self.accepted_status_words
            .iter()
            .any(|accepted| accepted.eq_ignore_ascii_case(word))
    }

    pub fn parse_command(&self) -> Result<Command, apdu::Error> {
        Command::parse_hex(&self.command_hex)
    }

    fn validate(&self) -> Result<(), Error> {
        self.parse_command().map_err(|source| Error::InvalidCommand {
            step: self.name.clone(),
            source,
        })?;
        if self.accepted_status_words.is_empty() {
            return Err(Error::NoAcceptedStatusWords(self.name.clone()));
        }
        for word in &self.accepted_status_words {
            if word.len() != 4 || !word.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::InvalidStatusWord {
                    step: self.name.clone(),
                    word: word.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step. Duplicate names are allowed.
    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.add_step(step);
        self
    }

    /// First step with exactly this name.
    pub fn find_step_by_name(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check that the scenario has steps and every command and status word decodes.
    pub fn validate(&self) -> Result<(), Error> {
        if self.steps.is_empty() {
            return Err(Error::Empty(self.name.clone()));
        }
        self.steps.iter().try_for_each(Step::validate)
    }
}

/// Scenarios by name. Built once at startup and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct ScenarioCatalog {
    scenarios: BTreeMap<String, Scenario>,
}

impl ScenarioCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a scenario under its own name.
    pub fn insert(&mut self, scenario: Scenario) -> Option<Scenario> {
        self.scenarios.insert(scenario.name.clone(), scenario)
    }

    pub fn with_scenario(mut self, scenario: Scenario) -> Self {
        self.insert(scenario);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scenarios.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Load definitions from JSON, either a single scenario object or an array of them.
    /// Every scenario is validated before it is accepted.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Definitions {
            Many(Vec<Scenario>),
            One(Scenario),
        }

        let scenarios = match serde_json::from_str(json)? {
            Definitions::Many(scenarios) => scenarios,
            Definitions::One(scenario) => vec![scenario],
        };
        let mut catalog = Self::new();
        for scenario in scenarios {
            scenario.validate()?;
            if let Some(previous) = catalog.insert(scenario) {
                tracing::warn!("scenario '{}' defined more than once", previous.name);
            }
        }
        Ok(catalog)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut json = String::new();
        File::open(path)?.read_to_string(&mut json)?;
        Self::from_json(&json)
    }
}

impl FromIterator<Scenario> for ScenarioCatalog {
    fn from_iter<T: IntoIterator<Item = Scenario>>(iter: T) -> Self {
        Self {
            scenarios: iter
                .into_iter()
                .map(|scenario| (scenario.name.clone(), scenario))
                .collect(),
        }
    }
}
