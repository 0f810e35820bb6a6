//! copilot-hub library root.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod hub;
pub mod logging;
pub mod participant;

pub use cli::Commands;
pub use config::{load_settings, load_settings_or_default, Settings};
pub use error::{Error, Result};
pub use hub::{Hub, HubStats, RetireReport};
pub use participant::{
    Delivery, DeliveryError, Participant, ParticipantDirectory, ParticipantKind,
    ParticipantRegistry, PresentationSink, ReplyError,
};
