use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use popp::definitions::message::{ScenarioResponseMessage, StartMessage};
use popp::definitions::{Message, Scenario, ScenarioCatalog, Step};
use popp::issuance::CredentialStore;
use popp::presentation::server::Transport;
use popp::presentation::session::CloseStatus;
use popp::presentation::ProofService;
use popp::Config;

pub const SIGNER_KEY: &str = include_str!("data/signer-key.pem");
pub const SIGNER_CERT: &[u8] = include_bytes!("data/signer-cert.pem");

#[allow(dead_code)]
fn main() {}

#[allow(dead_code)]
pub fn credentials() -> Result<Arc<CredentialStore>> {
    let store = CredentialStore::builder()
        .with_signing_key_pem("popp-signer", SIGNER_KEY)?
        .with_certificate_pem(SIGNER_CERT)?
        .build()
        .context("could not build credential store")?;
    Ok(Arc::new(store))
}

/// A select followed by a read of the personal data record.
#[allow(dead_code)]
pub fn catalog() -> ScenarioCatalog {
    ScenarioCatalog::new()
        .with_scenario(
            Scenario::new("default")
                .with_step(Step::new("select", "00A4040C06D27600000102"))
                .with_step(
                    Step::new("read-pd", "00B0810000")
                        .with_accepted_status_words(["9000", "6282"]),
                ),
        )
        .with_scenario(
            Scenario::new("contactless")
                .with_step(Step::new("select", "00A4040C06D27600000102")),
        )
}

#[allow(dead_code)]
pub fn service() -> Result<Arc<ProofService>> {
    let mut config = Config::default();
    config
        .scenario_by_connection_type
        .insert("contactless-standard".into(), "contactless".into());
    Ok(Arc::new(ProofService::new(config, catalog(), credentials()?)?))
}

#[allow(dead_code)]
pub fn start(card_connection_type: &str) -> String {
    Message::Start(StartMessage {
        version: "1.0.0".into(),
        card_connection_type: card_connection_type.into(),
        client_session_id: "client-1".into(),
    })
    .to_json()
    .expect("message serializes")
}

#[allow(dead_code)]
pub fn scenario_response(steps: &[&str]) -> String {
    Message::ScenarioResponse(ScenarioResponseMessage {
        steps: steps.iter().map(|step| step.to_string()).collect(),
    })
    .to_json()
    .expect("message serializes")
}

/// Personal data record answered by the card, with a success status word.
#[allow(dead_code)]
pub fn personal_data_response() -> String {
    format!("{}9000", hex::encode_upper("KVNR:X110411675|IKNR:109500969"))
}

/// A peer that plays back scripted frames and records what it receives.
#[derive(Debug, Default)]
pub struct ScriptedPeer {
    inbound: VecDeque<String>,
    /// Stay silent instead of disconnecting once the script is exhausted.
    hang_up_never: bool,
    pub received: Vec<Message>,
    pub closed: Option<(CloseStatus, String)>,
}

#[allow(dead_code)]
impl ScriptedPeer {
    pub fn new<I: IntoIterator<Item = String>>(frames: I) -> Self {
        Self {
            inbound: frames.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn silent_afterwards(mut self) -> Self {
        self.hang_up_never = true;
        self
    }
}

#[async_trait]
impl Transport for ScriptedPeer {
    type Error = Infallible;

    async fn recv(&mut self) -> Result<Option<String>, Infallible> {
        match self.inbound.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None if self.hang_up_never => std::future::pending().await,
            None => Ok(None),
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), Infallible> {
        let message = Message::from_json(&frame).expect("server sent an undecodable frame");
        self.received.push(message);
        Ok(())
    }

    async fn close(&mut self, status: CloseStatus, reason: &str) -> Result<(), Infallible> {
        self.closed = Some((status, reason.to_string()));
        Ok(())
    }
}
