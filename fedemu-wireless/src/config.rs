use fedemu_net::tc::LinkParams;
use fedemu_wire::{tlv::config, Message};

use crate::{Result, WirelessError};

/// Configuration object of the range model.
pub const RANGE_CONFIG_OBJECT: &str = "basic_range";

/// Settings of a [`RangeModel`](crate::RangeModel). Zero link parameters are unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeConfig {
    /// Maximum distance between two linked interfaces, in canvas pixels.
    pub range: f64,
    /// Bits per second.
    pub bandwidth: Option<u64>,
    /// Microseconds.
    pub delay: Option<u64>,
    /// Microseconds.
    pub jitter: Option<u64>,
    /// Percent.
    pub loss: Option<f64>,
    /// Disables MAC learning on the bridge, so every frame reaches every interface.
    pub promiscuous: bool,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            range: 275.0,
            bandwidth: Some(54_000_000),
            delay: Some(5_000),
            jitter: None,
            loss: None,
            promiscuous: false,
        }
    }
}

fn number(field: &str, value: &str) -> Result<f64> {
    value.trim().parse().map_err(|_| WirelessError::InvalidConfig(format!("{field}: {value:?}")))
}

fn unset_if_zero(value: f64) -> Option<u64> {
    (value > 0.0).then_some(value as u64)
}

impl RangeConfig {
    /// Parses the positional `|` separated values of a configuration message: range,
    /// bandwidth, jitter, delay, loss and optionally promiscuous (`0`/`1`).
    pub fn from_values(values: &str) -> Result<Self> {
        let fields: Vec<&str> = values.split('|').collect();
        let [range, bandwidth, jitter, delay, loss, rest @ ..] = fields.as_slice() else {
            return Err(WirelessError::InvalidConfig(format!("expected at least 5 values, got {values:?}")));
        };

        let loss = number("loss", loss)?;
        let promiscuous = match rest.first().map(|p| p.trim()) {
            None | Some("" | "0") => false,
            Some(p) => number("promiscuous", p)? != 0.0,
        };

        Ok(Self {
            range: number("range", range)?,
            bandwidth: unset_if_zero(number("bandwidth", bandwidth)?),
            delay: unset_if_zero(number("delay", delay)?),
            jitter: unset_if_zero(number("jitter", jitter)?),
            loss: (loss > 0.0).then_some(loss),
            promiscuous,
        })
    }

    /// Reads the configuration carried by a CONFIG message for the range model. Returns
    /// `None` for messages about other objects.
    pub fn from_message(msg: &Message) -> Option<Result<Self>> {
        if msg.tlv_str(config::OBJECT) != Some(RANGE_CONFIG_OBJECT) {
            return None;
        }
        let values = msg.tlv_str(config::VALUES).unwrap_or_default();
        Some(Self::from_values(values))
    }

    /// The parameters applied to every linked interface.
    pub fn link_params(&self) -> LinkParams {
        LinkParams {
            bandwidth: self.bandwidth,
            delay: self.delay,
            jitter: self.jitter,
            loss: self.loss,
            duplicate: None,
        }
    }
}
