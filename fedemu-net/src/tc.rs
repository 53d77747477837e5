//! Link shaping with `tc netem`.

use crate::command::{self, CommandRunner};

/// Parameters applied to an emulated link. `None` leaves the corresponding impairment
/// unset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkParams {
    /// Bandwidth in bits per second.
    pub bandwidth: Option<u64>,
    /// Delay in microseconds.
    pub delay: Option<u64>,
    /// Jitter in microseconds.
    pub jitter: Option<u64>,
    /// Packet loss percentage (0.0 to 100.0).
    pub loss: Option<f64>,
    /// Packet duplication percentage (0.0 to 100.0).
    pub duplicate: Option<f64>,
}

impl LinkParams {
    /// Returns `true` if no impairment is set.
    pub fn is_empty(&self) -> bool {
        self.bandwidth.is_none()
            && self.delay.is_none()
            && self.jitter.is_none()
            && self.loss.is_none()
            && self.duplicate.is_none()
    }

    /// The `netem` arguments for these parameters.
    pub fn netem_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        // jitter without a delay is meaningless to netem
        if self.delay.is_some() || self.jitter.is_some() {
            args.push("delay".to_owned());
            args.push(format!("{}us", self.delay.unwrap_or(0)));
            if let Some(jitter) = self.jitter {
                args.push(format!("{jitter}us"));
            }
        }
        if let Some(loss) = self.loss {
            args.push("loss".to_owned());
            args.push(format!("{loss}%"));
        }
        if let Some(duplicate) = self.duplicate {
            args.push("duplicate".to_owned());
            args.push(format!("{duplicate}%"));
        }
        if let Some(bandwidth) = self.bandwidth {
            args.push("rate".to_owned());
            args.push(format!("{bandwidth}bit"));
        }

        args
    }
}

/// Apply `params` to the root qdisc of `dev`. Empty parameters remove any shaping.
pub fn apply(runner: &dyn CommandRunner, dev: &str, params: &LinkParams) -> command::Result<()> {
    if params.is_empty() {
        let args = ["qdisc", "del", "dev", dev, "root"].map(str::to_owned);
        if let Err(e) = runner.run("tc", &args) {
            // no qdisc installed yet
            tracing::trace!(?e, dev, "no root qdisc to delete");
        }
        return Ok(());
    }

    let mut args: Vec<String> =
        ["qdisc", "replace", "dev", dev, "root", "netem"].map(str::to_owned).into();
    args.extend(params.netem_args());

    tracing::debug!(dev, ?params, "shaping link");
    runner.run("tc", &args)?;
    Ok(())
}
