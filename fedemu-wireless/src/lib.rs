#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Wireless networks whose connectivity follows the distance between nodes.
//!
//! A [`RangeModel`] links the interfaces of a [`WirelessNetwork`] that are within range
//! of each other. The network turns its link state into ebtables rules, which the shared
//! [`LinkRuleScheduler`] commits at a bounded rate.

use thiserror::Error;

mod config;
pub use config::{RangeConfig, RANGE_CONFIG_OBJECT};

mod event;
pub use event::{LinkEvent, LinkEventKind};

mod network;
pub use network::{InterfaceId, WirelessNetwork};

mod range;
pub use range::{LinkShaper, Position, RangeModel, TcShaper};

pub mod scheduler;
pub use scheduler::{LinkRuleScheduler, RuleEngine, SchedulerOptions};

/// Errors of the wireless models.
#[derive(Debug, Error)]
pub enum WirelessError {
    /// Shaping a link or toggling bridge learning failed.
    #[error("command error: {0}")]
    Command(#[from] fedemu_net::command::Error),
    /// A configuration value could not be parsed.
    #[error("invalid range configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, WirelessError>;
