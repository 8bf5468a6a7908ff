//! Proof tokens by card identity, so a card that proved presence recently is
//! not interrogated again within the freshness window.
//!
//! Freshness is judged by the token's `patientProofTime` claim, not by the
//! time of insertion; a stale entry is evicted on the read that finds it.
use std::time::Duration;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::definitions::token::ProofClaims;
use crate::presentation::token::TokenParser;

const DEFAULT_CAPACITY: u64 = 10_000;

/// Where a card was presented.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardIdentity {
    pub terminal_id: String,
    pub slot_id: String,
    pub card_id: String,
}

impl CardIdentity {
    pub fn new(
        terminal_id: impl Into<String>,
        slot_id: impl Into<String>,
        card_id: impl Into<String>,
    ) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            slot_id: slot_id.into(),
            card_id: card_id.into(),
        }
    }
}

/// Concurrent, expiry aware token cache. Cloning shares the underlying storage.
#[derive(Clone)]
pub struct TokenCache {
    entries: Cache<CardIdentity, String>,
    freshness_window: Duration,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("entries", &self.entries.entry_count())
            .field("freshness_window", &self.freshness_window)
            .finish()
    }
}

impl TokenCache {
    pub fn new(freshness_window: Duration) -> Self {
        Self::with_capacity(freshness_window, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(freshness_window: Duration, capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            // Insertion always happens after the proof, so this never evicts a fresh entry.
            .time_to_live(freshness_window)
            .build();
        Self {
            entries,
            freshness_window,
        }
    }

    /// Store a token, or remove the entry when `token` is `None`.
    pub fn put(&self, identity: CardIdentity, token: Option<String>) {
        match token {
            Some(token) => self.entries.insert(identity, token),
            None => self.entries.invalidate(&identity),
        }
    }

    pub fn get(&self, identity: &CardIdentity) -> Option<String> {
        self.get_at(identity, OffsetDateTime::now_utc())
    }

    /// Look up a token as of `now`, evicting it when its proof is too old.
    pub fn get_at(&self, identity: &CardIdentity, now: OffsetDateTime) -> Option<String> {
        let token = self.entries.get(identity)?;
        let proof_time = match TokenParser::parse_unverified::<ProofClaims>(&token) {
            Ok(decoded) => decoded.claims.patient_proof_time,
            Err(e) => {
                warn!("evicting unreadable cached token for {identity:?}: {e}");
                self.entries.invalidate(identity);
                return None;
            }
        };
        let age = now.unix_timestamp() - proof_time;
        if age > self.freshness_window.as_secs() as i64 {
            debug!("evicting stale proof for {identity:?}, {age}s old");
            self.entries.invalidate(identity);
            return None;
        }
        Some(token)
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::issuance::credentials::test::store;
    use crate::issuance::TokenIssuer;
    use std::sync::Arc;
    use time::Duration as TimeDuration;

    const NINETY_DAYS: Duration = Duration::from_secs(90 * 24 * 60 * 60);

    fn token_proved_at(proof_time: OffsetDateTime) -> String {
        let issuer = TokenIssuer::new(Arc::new(store()), &Config::default());
        let claims = issuer.proof_claims(&Default::default(), proof_time);
        issuer.issue_proof(&claims).unwrap()
    }

    fn identity() -> CardIdentity {
        CardIdentity::new("terminal-1", "slot-1", "80276883110000095711")
    }

    #[test]
    fn fresh_token_is_returned() {
        let cache = TokenCache::new(NINETY_DAYS);
        let token = token_proved_at(OffsetDateTime::now_utc());
        cache.put(identity(), Some(token.clone()));
        assert_eq!(cache.get(&identity()), Some(token));
        assert_eq!(cache.get(&CardIdentity::new("terminal-1", "slot-2", "x")), None);
    }

    #[test]
    fn stale_token_is_evicted() {
        let cache = TokenCache::new(NINETY_DAYS);
        let now = OffsetDateTime::now_utc();
        let stale = token_proved_at(now - TimeDuration::days(91));
        cache.put(identity(), Some(stale));
        assert_eq!(cache.get_at(&identity(), now), None);

        let fresh = token_proved_at(now);
        cache.put(identity(), Some(fresh.clone()));
        assert_eq!(cache.get_at(&identity(), now), Some(fresh));
    }

    #[test]
    fn freshness_is_judged_at_read_time() {
        let cache = TokenCache::new(NINETY_DAYS);
        let now = OffsetDateTime::now_utc();
        let token = token_proved_at(now - TimeDuration::days(89));
        cache.put(identity(), Some(token.clone()));
        assert_eq!(cache.get_at(&identity(), now), Some(token));
        assert_eq!(cache.get_at(&identity(), now + TimeDuration::days(2)), None);
        // Evicted, so going back in time does not resurrect it.
        assert_eq!(cache.get_at(&identity(), now), None);
    }

    #[test]
    fn put_none_removes() {
        let cache = TokenCache::new(NINETY_DAYS);
        cache.put(identity(), Some(token_proved_at(OffsetDateTime::now_utc())));
        cache.put(identity(), None);
        assert_eq!(cache.get(&identity()), None);
    }

    #[test]
    fn unreadable_entries_are_dropped() {
        let cache = TokenCache::new(NINETY_DAYS);
        cache.put(identity(), Some("not-a-token".into()));
        assert_eq!(cache.get(&identity()), None);
    }

    #[test]
    fn clear_drops_everything() {
        let cache = TokenCache::new(NINETY_DAYS);
        let token = token_proved_at(OffsetDateTime::now_utc());
        cache.put(identity(), Some(token.clone()));
        cache.put(CardIdentity::new("t2", "s2", "c2"), Some(token));
        cache.clear();
        assert_eq!(cache.get(&identity()), None);
        assert_eq!(cache.get(&CardIdentity::new("t2", "s2", "c2")), None);
    }

    #[test]
    fn identities_differing_in_one_field_do_not_collide() {
        let cache = TokenCache::new(NINETY_DAYS);
        let token = token_proved_at(OffsetDateTime::now_utc());
        cache.put(CardIdentity::new("ab", "c", "d"), Some(token));
        assert_eq!(cache.get(&CardIdentity::new("a", "bc", "d")), None);
    }
}
