pub mod apdu;
pub mod card_data;
pub mod message;
pub mod scenario;
pub mod token;

pub use apdu::{Command, Response, StatusWord};
pub use card_data::CardIdentifiers;
pub use message::Message;
pub use scenario::{Scenario, ScenarioCatalog, Step};
