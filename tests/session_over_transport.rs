use std::sync::Arc;

use anyhow::{Context, Result};
use time::OffsetDateTime;

use popp::definitions::token::ProofClaims;
use popp::definitions::Message;
use popp::presentation::server::serve;
use popp::presentation::session::{CloseStatus, State};
use popp::presentation::{CardIdentity, ProofService, SessionManager, TokenParser};
use popp::Config;

pub mod common;
use common::{personal_data_response, scenario_response, start, ScriptedPeer};

#[tokio::test]
async fn completed_session_yields_verifiable_token() -> Result<()> {
    let service = common::service()?;
    let mut peer = ScriptedPeer::new([
        start("contact-standard"),
        scenario_response(&["9000", &personal_data_response()]),
    ]);
    let mut session = SessionManager::new(service);

    let status = serve(&mut peer, &mut session).await?;
    assert_eq!(status, Some(CloseStatus::Normal));
    assert_eq!(session.state(), &State::Completed);

    let [Message::StandardScenario(dispatch), Message::Token(token)] = peer.received.as_slice()
    else {
        panic!("unexpected exchange: {:?}", peer.received)
    };
    assert_eq!(dispatch.client_session_id, "client-1");
    assert_eq!(dispatch.steps.len(), 2);
    assert_eq!(token.pn, "X110411675");

    let parser = TokenParser::new(common::credentials()?);
    let claims = parser.parse_verified::<ProofClaims>(&token.token)?.claims;
    assert_eq!(claims.patient_id.as_deref(), Some("X110411675"));
    assert_eq!(claims.insurer_id.as_deref(), Some("109500969"));
    assert_eq!(claims.proof_method, "ehc-practitioner-trustedchannel");
    assert!(claims.patient_proof_time <= OffsetDateTime::now_utc().unix_timestamp());
    Ok(())
}

#[tokio::test]
async fn connection_type_selects_scenario() -> Result<()> {
    let mut peer = ScriptedPeer::new([
        start("contactless-standard"),
        scenario_response(&["9000"]),
    ]);
    let mut session = SessionManager::new(common::service()?);

    assert_eq!(serve(&mut peer, &mut session).await?, Some(CloseStatus::Normal));
    let Some(Message::Token(token)) = peer.received.last() else {
        panic!("no token in {:?}", peer.received)
    };
    // The contactless scenario reads no identifiers.
    assert_eq!(token.pn, "");
    Ok(())
}

#[tokio::test]
async fn rejected_step_reports_error() -> Result<()> {
    let mut peer = ScriptedPeer::new([
        start("contact-standard"),
        scenario_response(&["9000", "6A82"]),
    ]);
    let mut session = SessionManager::new(common::service()?);

    assert_eq!(serve(&mut peer, &mut session).await?, Some(CloseStatus::BadData));
    let Some(Message::Error(error)) = peer.received.last() else {
        panic!("no error in {:?}", peer.received)
    };
    assert_eq!(error.error_code, "protocolViolation");
    assert!(error.error_detail.contains("read-pd"));
    assert!(!peer.received.iter().any(|m| matches!(m, Message::Token(_))));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_client_times_out() -> Result<()> {
    let mut peer = ScriptedPeer::new([start("contact-standard")]).silent_afterwards();
    let mut session = SessionManager::new(common::service()?);

    assert_eq!(serve(&mut peer, &mut session).await?, Some(CloseStatus::Timeout));
    let Some(Message::Error(error)) = peer.received.last() else {
        panic!("no error in {:?}", peer.received)
    };
    assert_eq!(error.error_code, "timeout");
    assert_eq!(peer.closed.as_ref().map(|(status, _)| status.code()), Some(4408));
    Ok(())
}

#[tokio::test]
async fn disconnect_before_start_ends_quietly() -> Result<()> {
    let mut peer = ScriptedPeer::new([]);
    let mut session = SessionManager::new(common::service()?);
    assert_eq!(serve(&mut peer, &mut session).await?, None);
    assert!(peer.received.is_empty());
    assert!(peer.closed.is_none());
    Ok(())
}

#[tokio::test]
async fn peer_error_is_not_answered() -> Result<()> {
    let mut peer = ScriptedPeer::new([
        start("contact-standard"),
        r#"{"type":"Error","errorCode":"cardRemoved","errorDetail":"card was pulled"}"#.into(),
    ]);
    let mut session = SessionManager::new(common::service()?);

    assert_eq!(serve(&mut peer, &mut session).await?, Some(CloseStatus::NotAcceptable));
    assert_eq!(peer.received.len(), 1);
    Ok(())
}

#[tokio::test]
async fn completed_proof_is_served_from_cache() -> Result<()> {
    let service = Arc::new(
        ProofService::new(Config::default(), common::catalog(), common::credentials()?)?
            .with_token_cache(),
    );
    let cache = service.cache().cloned().context("service has no token cache")?;
    let identity = CardIdentity::new("terminal-7", "2", "80276883110000095711");
    assert_eq!(cache.get(&identity), None);

    let mut peer = ScriptedPeer::new([
        start("contact-standard"),
        scenario_response(&["9000", &personal_data_response()]),
    ]);
    let mut session = SessionManager::new(service).with_identity(identity.clone());
    serve(&mut peer, &mut session).await?;

    let Some(Message::Token(token)) = peer.received.last() else {
        panic!("no token in {:?}", peer.received)
    };
    assert_eq!(cache.get(&identity).as_deref(), Some(token.token.as_str()));
    assert_eq!(
        cache.get(&CardIdentity::new("terminal-7", "3", "80276883110000095711")),
        None
    );
    Ok(())
}
