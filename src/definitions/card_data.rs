//! Identity records carried in card response data.
//!
//! The simulated cards return their identifiers as `|`-separated `KEY:value`
//! records, e.g. `KVNR:X110411675|IKNR:109500969`. An optional `VER:` record
//! selects the encoding version; only version 1 is understood. Extraction is
//! best effort: anything that cannot be read leaves the field unset.
use serde::{Deserialize, Serialize};

const RECORD_SEPARATOR: char = '|';
const KEY_SEPARATOR: char = ':';
const SUPPORTED_VERSION: &str = "1";

const KEY_VERSION: &str = "VER";
const KEY_PATIENT_ID: &str = "KVNR";
const KEY_INSURER_ID: &str = "IKNR";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardIdentifiers {
    pub patient_id: Option<String>,
    pub insurer_id: Option<String>,
}

impl CardIdentifiers {
    /// Read identifiers from a single response data field.
    pub fn from_payload(payload: &[u8]) -> Self {
        let Ok(text) = std::str::from_utf8(payload) else {
            return Self::default();
        };
        let mut identifiers = Self::default();
        for record in text.trim().split(RECORD_SEPARATOR) {
            let Some((key, value)) = record.split_once(KEY_SEPARATOR) else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                KEY_VERSION if value != SUPPORTED_VERSION => {
                    tracing::debug!("ignoring card data with encoding version {value}");
                    return Self::default();
                }
                KEY_PATIENT_ID => identifiers.patient_id = Some(value.to_string()),
                KEY_INSURER_ID => identifiers.insurer_id = Some(value.to_string()),
                _ => {}
            }
        }
        identifiers
    }

    /// Fill unset fields from the payloads in order; the first value found wins.
    pub fn from_payloads<'a>(payloads: impl IntoIterator<Item = &'a [u8]>) -> Self {
        payloads
            .into_iter()
            .fold(Self::default(), |acc, payload| acc.or(Self::from_payload(payload)))
    }

    fn or(self, other: Self) -> Self {
        Self {
            patient_id: self.patient_id.or(other.patient_id),
            insurer_id: self.insurer_id.or(other.insurer_id),
        }
    }

    /// The identifier reported back to the client: the patient id, else the insurer id.
    pub fn display_identifier(&self) -> &str {
        self.patient_id
            .as_deref()
            .or(self.insurer_id.as_deref())
            .unwrap_or_default()
    }
}
