//! Presence proofs for health cards.
//!
//! A client with a card reader connects, announces itself with `Start`, and
//! receives a scenario of APDU commands to run against the card. When every
//! response ends with an acceptable status word, the server mints a signed
//! proof token carrying the identifiers read from the card.
//!
//! - [definitions] holds the wire formats: APDUs, scenarios, messages and tokens.
//! - [issuance] holds the credential store and the token issuer.
//! - [presentation] holds the session engine, its transport driver, the token
//!   parser and the proof cache.
pub mod config;
pub mod definitions;
pub mod issuance;
pub mod presentation;

pub use config::Config;
