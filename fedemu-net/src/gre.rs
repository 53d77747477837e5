use std::net::IpAddr;

use crate::command::{self, CommandRunner};

pub const GRE_DEVICE_PREFIX: &str = "gt.";

/// Default TTL of the encapsulating packets.
pub const DEFAULT_TTL: u8 = 255;

/// A GRE tap device (`ip link add .. type gretap`): an ethernet-over-GRE tunnel to a
/// remote emulation host.
///
/// Note: device name length can be max 15 chars long, so names are derived from the
/// tunnel key rather than from node names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreTap {
    pub name: String,
    pub remote: IpAddr,
    pub key: u32,
    pub ttl: u8,
}

impl GreTap {
    pub fn new(remote: IpAddr, key: u32) -> Self {
        Self { name: Self::device_name(key), remote, key, ttl: DEFAULT_TTL }
    }

    pub fn device_name(key: u32) -> String {
        format!("{GRE_DEVICE_PREFIX}{key:x}")
    }

    /// Create the device and bring it up.
    pub fn create(&self, runner: &dyn CommandRunner) -> command::Result<()> {
        let _span = tracing::debug_span!("gretap_create", dev = %self.name, remote = %self.remote, key = self.key)
            .entered();

        let add = [
            "link".to_owned(),
            "add".to_owned(),
            self.name.clone(),
            "type".to_owned(),
            "gretap".to_owned(),
            "remote".to_owned(),
            self.remote.to_string(),
            "key".to_owned(),
            self.key.to_string(),
            "ttl".to_owned(),
            self.ttl.to_string(),
        ];
        runner.run("ip", &add)?;
        runner.run("ip", &["link".into(), "set".into(), self.name.clone(), "up".into()])?;

        tracing::debug!("created gretap device");
        Ok(())
    }

    pub fn destroy(&self, runner: &dyn CommandRunner) -> command::Result<()> {
        runner.run("ip", &["link".into(), "delete".into(), self.name.clone()])?;
        tracing::debug!(dev = %self.name, "deleted gretap device");
        Ok(())
    }
}
