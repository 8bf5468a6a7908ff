//! The server side of the proof protocol.
pub mod cache;
pub mod server;
pub mod session;
pub mod token;

pub use cache::{CardIdentity, TokenCache};
pub use session::{ProofService, SessionManager};
pub use token::TokenParser;
