pub mod action_cards;
pub mod client;
pub mod controller;
pub mod error;
pub mod inbox;
pub mod moderation;
pub mod normalize;
pub mod notifications;
pub mod policy;
pub mod ports;
pub mod safe_mode;
pub mod thread;
pub mod uploads;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
