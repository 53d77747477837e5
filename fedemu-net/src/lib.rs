#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod bridge;
pub mod command;
pub mod ebtables;
pub mod gre;
pub mod tc;

pub use command::{CommandRunner, Recorder, SystemRunner};
