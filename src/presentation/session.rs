//! The server side of a presence proof, one [SessionManager] per connection.
//!
//! ```text
//!            Start                 ScenarioResponse (all accepted)
//!   Idle ─────────────▶ Dispatched ───────────────────────────────▶ Completed
//!     │                     │                                        (Token, close 1000)
//!     │                     │ wrong count, unexpected status word,
//!     │                     │ timeout, signing failure
//!     └─────────────────────┴──────────────────────────────────────▶ Failed
//!        malformed frame, unknown type, out of order message,         (Error, close)
//!        Error from the peer
//! ```
//!
//! The manager does no I/O. Each inbound text frame is turned into a [Reply]:
//! at most one outbound message plus a [Directive] telling the transport
//! whether to keep the connection open or close it with a status. Every
//! session ends with exactly one `Token` or one `Error` (none when the peer
//! reported the error itself) followed by a close.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::{self, Config},
    definitions::{
        apdu::{self, extract_data, extract_status_word, StatusWord},
        card_data::CardIdentifiers,
        message::{
            DecodeError, ErrorMessage, Message, ScenarioResponseMessage, ScenarioStep,
            StandardScenarioMessage, StartMessage, TokenMessage,
        },
        scenario::{self, ScenarioCatalog, Step},
    },
    issuance::{credentials::CredentialStore, token, TokenIssuer},
    presentation::cache::{CardIdentity, TokenCache},
};

/// Close codes handed to the transport, following the WebSocket numbering.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum CloseStatus {
    Normal = 1000,
    NotAcceptable = 1003,
    BadData = 1007,
    PolicyViolation = 1008,
    InternalError = 1011,
    Timeout = 4408,
}

impl CloseStatus {
    pub const fn code(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    KeepOpen,
    Close { status: CloseStatus, reason: String },
}

/// What the transport has to do after a frame was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub message: Option<Message>,
    pub directive: Directive,
}

impl Reply {
    fn keep_open(message: Option<Message>) -> Self {
        Self {
            message,
            directive: Directive::KeepOpen,
        }
    }

    fn close(message: Option<Message>, status: CloseStatus, reason: impl Into<String>) -> Self {
        Self {
            message,
            directive: Directive::Close {
                status,
                reason: reason.into(),
            },
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self.directive, Directive::Close { .. })
    }

    /// The outbound message as a text frame.
    pub fn frame(&self) -> Result<Option<String>, serde_json::Error> {
        self.message.as_ref().map(Message::to_json).transpose()
    }
}

/// Everything that ends a session early.
///
/// The serialized variant name is the `errorCode` sent to the peer.
#[derive(Debug, thiserror::Error, strum_macros::AsRefStr)]
#[strum(serialize_all = "camelCase")]
pub enum Error {
    #[error("could not parse message: {0}")]
    Parse(String),
    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),
    #[error("{kind} message is not expected while {state}")]
    #[strum(serialize = "protocolViolation")]
    OutOfOrder {
        kind: &'static str,
        state: &'static str,
    },
    #[error("expected {expected} step responses, received {actual}")]
    #[strum(serialize = "protocolViolation")]
    StepCountMismatch { expected: usize, actual: usize },
    #[error("response to step {index} ('{step}') is malformed: {source}")]
    #[strum(serialize = "protocolViolation")]
    InvalidResponse {
        index: usize,
        step: String,
        #[source]
        source: apdu::Error,
    },
    #[error("step {index} ('{step}') ended with {status} ({description}), expected one of {expected:?}")]
    #[strum(serialize = "protocolViolation")]
    UnexpectedStatusWord {
        index: usize,
        step: String,
        status: StatusWord,
        description: &'static str,
        expected: Vec<String>,
    },
    #[error("scenario '{0}' is not known")]
    #[strum(serialize = "protocolViolation")]
    UnknownScenario(String),
    #[error("scenario is unusable: {0}")]
    #[strum(serialize = "internalError")]
    InvalidScenario(#[from] scenario::Error),
    #[error("could not issue token: {0}")]
    #[strum(serialize = "internalError")]
    Signing(#[from] token::Error),
    #[error("no scenario response within {0:?}")]
    Timeout(Duration),
    #[error("peer reported {}: {}", .0.error_code, .0.error_detail)]
    PeerError(ErrorMessage),
}

impl Error {
    pub fn error_code(&self) -> &str {
        self.as_ref()
    }

    pub fn close_status(&self) -> CloseStatus {
        match self {
            Error::Parse(_)
            | Error::OutOfOrder { .. }
            | Error::StepCountMismatch { .. }
            | Error::InvalidResponse { .. }
            | Error::UnexpectedStatusWord { .. }
            | Error::UnknownScenario(_) => CloseStatus::BadData,
            Error::UnknownMessageType(_) => CloseStatus::PolicyViolation,
            Error::InvalidScenario(_) | Error::Signing(_) => CloseStatus::InternalError,
            Error::Timeout(_) => CloseStatus::Timeout,
            Error::PeerError(_) => CloseStatus::NotAcceptable,
        }
    }

    /// The message reported to the peer. A peer's own error is not echoed back.
    pub fn to_message(&self) -> Option<Message> {
        match self {
            Error::PeerError(_) => None,
            error => Some(Message::Error(ErrorMessage::new(
                error.error_code(),
                error.to_string(),
            ))),
        }
    }
}

impl From<DecodeError> for Error {
    fn from(error: DecodeError) -> Self {
        match error {
            DecodeError::UnknownType(kind) => Error::UnknownMessageType(kind),
            error => Error::Parse(error.to_string()),
        }
    }
}

/// Shared, read-only collaborators of all sessions.
///
/// Built once at startup; sessions hold it behind an [Arc].
#[derive(Debug)]
pub struct ProofService {
    config: Config,
    catalog: ScenarioCatalog,
    issuer: TokenIssuer,
    cache: Option<TokenCache>,
    sequence_counter: AtomicU64,
}

impl ProofService {
    pub fn new(
        config: Config,
        catalog: ScenarioCatalog,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self, config::Error> {
        config.validate()?;
        let issuer = TokenIssuer::new(credentials, &config);
        Ok(Self {
            config,
            catalog,
            issuer,
            cache: None,
            sequence_counter: AtomicU64::new(0),
        })
    }

    /// Store minted tokens for sessions bound to a [CardIdentity], in a cache
    /// evicting proofs older than the configured `freshnessWindowDays`.
    ///
    /// Collaborators share the same storage through a clone of [Self::cache].
    pub fn with_token_cache(mut self) -> Self {
        self.cache = Some(TokenCache::new(self.config.freshness_window()));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &ScenarioCatalog {
        &self.catalog
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub fn cache(&self) -> Option<&TokenCache> {
        self.cache.as_ref()
    }

    fn next_sequence_counter(&self) -> u64 {
        self.sequence_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// The state of a [SessionManager].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum State {
    /// Waiting for `Start`.
    #[default]
    Idle,
    /// Steps were sent; waiting for their responses until `deadline`.
    Dispatched { steps: Vec<Step>, deadline: Instant },
    /// A token was sent.
    Completed,
    /// An error ended the session.
    Failed(CloseStatus),
}

impl State {
    pub const fn name(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Dispatched { .. } => "dispatched",
            State::Completed => "completed",
            State::Failed(_) => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, State::Completed | State::Failed(_))
    }
}

/// Per-connection protocol state machine.
#[derive(Debug)]
pub struct SessionManager {
    service: Arc<ProofService>,
    id: Uuid,
    client_session_id: Option<String>,
    identity: Option<CardIdentity>,
    state: State,
}

impl SessionManager {
    pub fn new(service: Arc<ProofService>) -> Self {
        Self {
            service,
            id: Uuid::new_v4(),
            client_session_id: None,
            identity: None,
            state: State::Idle,
        }
    }

    /// Bind the session to the card it interrogates; a successful proof is then cached.
    pub fn with_identity(mut self, identity: CardIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client_session_id(&self) -> Option<&str> {
        self.client_session_id.as_deref()
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_terminal()
    }

    /// When the dispatched scenario times out, if one is outstanding.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            State::Dispatched { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    pub fn handle_frame(&mut self, frame: &str) -> Reply {
        self.handle_frame_at(frame, Instant::now())
    }

    pub fn handle_frame_at(&mut self, frame: &str, now: Instant) -> Reply {
        if let Some(reply) = self.closed_reply() {
            debug!(session = %self.id, "ignoring frame on closed session");
            return reply;
        }
        let result = match Message::from_json(frame) {
            Ok(message) => self.handle_message(message, now),
            Err(error) => Err(error.into()),
        };
        result.unwrap_or_else(|error| self.fail(error))
    }

    /// Fail the session if its scenario is overdue at `now`.
    pub fn handle_timeout_at(&mut self, now: Instant) -> Reply {
        if let Some(reply) = self.closed_reply() {
            return reply;
        }
        match self.check_deadline(now) {
            Ok(()) => Reply::keep_open(None),
            Err(error) => self.fail(error),
        }
    }

    pub fn handle_timeout(&mut self) -> Reply {
        self.handle_timeout_at(Instant::now())
    }

    fn closed_reply(&self) -> Option<Reply> {
        match self.state {
            State::Completed => Some(Reply::close(None, CloseStatus::Normal, "completed")),
            State::Failed(status) => Some(Reply::close(None, status, "failed")),
            _ => None,
        }
    }

    fn handle_message(&mut self, message: Message, now: Instant) -> Result<Reply, Error> {
        debug!(session = %self.id, state = self.state.name(), kind = message.kind(), "received message");
        match message {
            Message::Error(error) => Err(Error::PeerError(error)),
            Message::Start(start) if self.state == State::Idle => self.start(start, now),
            Message::ScenarioResponse(response) if self.deadline().is_some() => {
                self.check_deadline(now)?;
                self.complete(response)
            }
            message => Err(Error::OutOfOrder {
                kind: message.kind(),
                state: self.state.name(),
            }),
        }
    }

    fn start(&mut self, start: StartMessage, now: Instant) -> Result<Reply, Error> {
        let config = self.service.config();
        let scenario_name = config.scenario_for(&start.card_connection_type);
        let scenario = self
            .service
            .catalog()
            .lookup(scenario_name)
            .ok_or_else(|| Error::UnknownScenario(scenario_name.to_string()))?;
        scenario.validate()?;

        let time_span = config.time_span();
        let dispatch = StandardScenarioMessage {
            version: config.scenario_version.clone(),
            client_session_id: start.client_session_id.clone(),
            sequence_counter: self.service.next_sequence_counter(),
            time_span: time_span.as_millis() as u64,
            steps: scenario.steps.iter().map(ScenarioStep::from).collect(),
        };
        info!(
            session = %self.id,
            client_session = %start.client_session_id,
            connection = %start.card_connection_type,
            scenario = %scenario.name,
            sequence = dispatch.sequence_counter,
            "dispatching scenario"
        );

        self.state = State::Dispatched {
            steps: scenario.steps.clone(),
            deadline: now + time_span,
        };
        self.client_session_id = Some(start.client_session_id);
        Ok(Reply::keep_open(Some(Message::StandardScenario(dispatch))))
    }

    fn check_deadline(&self, now: Instant) -> Result<(), Error> {
        match &self.state {
            State::Dispatched { deadline, .. } if now >= *deadline => {
                Err(Error::Timeout(self.service.config().time_span()))
            }
            _ => Ok(()),
        }
    }

    fn complete(&mut self, response: ScenarioResponseMessage) -> Result<Reply, Error> {
        let State::Dispatched { steps, .. } = &self.state else {
            return Err(Error::OutOfOrder {
                kind: "ScenarioResponse",
                state: self.state.name(),
            });
        };
        let payloads = validate_responses(steps, &response.steps)?;
        let identifiers =
            CardIdentifiers::from_payloads(payloads.iter().map(Vec::as_slice));

        let issuer = self.service.issuer();
        let claims = issuer.proof_claims(&identifiers, OffsetDateTime::now_utc());
        let token = issuer.issue_proof(&claims)?;

        if let (Some(cache), Some(identity)) = (self.service.cache(), &self.identity) {
            cache.put(identity.clone(), Some(token.clone()));
        }

        info!(session = %self.id, "scenario completed");
        self.state = State::Completed;
        let message = Message::Token(TokenMessage {
            token,
            pn: identifiers.display_identifier().to_string(),
        });
        Ok(Reply::close(Some(message), CloseStatus::Normal, "completed"))
    }

    fn fail(&mut self, error: Error) -> Reply {
        let status = error.close_status();
        match &error {
            Error::Signing(_) | Error::InvalidScenario(_) => {
                tracing::error!(session = %self.id, "session failed: {error}")
            }
            _ => warn!(session = %self.id, state = self.state.name(), "session failed: {error}"),
        }
        self.state = State::Failed(status);
        Reply::close(error.to_message(), status, error.error_code().to_string())
    }
}

/// Check the responses position by position against the dispatched steps and
/// return their data fields.
fn validate_responses(steps: &[Step], responses: &[String]) -> Result<Vec<Vec<u8>>, Error> {
    if steps.len() != responses.len() {
        return Err(Error::StepCountMismatch {
            expected: steps.len(),
            actual: responses.len(),
        });
    }

    steps
        .iter()
        .zip(responses)
        .enumerate()
        .map(|(index, (step, response_hex))| {
            debug!(index, step = %step.name, response = %response_hex, "checking step response");
            let invalid = |source| Error::InvalidResponse {
                index,
                step: step.name.clone(),
                source,
            };
            let bytes = hex::decode(response_hex)
                .map_err(|e| invalid(apdu::Error::InvalidFormat(format!("invalid hex: {e}"))))?;
            let status = StatusWord::from_u16(extract_status_word(&bytes).map_err(invalid)?);
            if !step.is_status_word_expected(&status.to_string()) {
                return Err(Error::UnexpectedStatusWord {
                    index,
                    step: step.name.clone(),
                    status,
                    description: status.description(),
                    expected: step.accepted_status_words.clone(),
                });
            }
            Ok(extract_data(&bytes).to_vec())
        })
        .collect()
}
