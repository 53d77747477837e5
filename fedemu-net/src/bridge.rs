use crate::command::{self, CommandRunner};

/// Kernel default MAC ageing time, in centiseconds.
pub const DEFAULT_AGEING_TIME: u32 = 30_000;

/// Toggle MAC learning on a bridge. With learning off (ageing time 0) the bridge floods
/// every frame like a hub, which is what a promiscuous wireless network needs.
pub fn set_learning(runner: &dyn CommandRunner, bridge: &str, enabled: bool) -> command::Result<()> {
    let ageing = if enabled { DEFAULT_AGEING_TIME } else { 0 };
    let args = [
        "link".to_owned(),
        "set".to_owned(),
        "dev".to_owned(),
        bridge.to_owned(),
        "type".to_owned(),
        "bridge".to_owned(),
        "ageing_time".to_owned(),
        ageing.to_string(),
    ];

    tracing::debug!(bridge, enabled, "setting bridge learning");
    runner.run("ip", &args)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Recorder;

    #[test]
    fn learning_toggles_ageing_time() {
        let recorder = Recorder::new();
        set_learning(&recorder, "b.3", false).unwrap();
        set_learning(&recorder, "b.3", true).unwrap();
        assert_eq!(
            recorder.commands(),
            vec![
                "ip link set dev b.3 type bridge ageing_time 0",
                "ip link set dev b.3 type bridge ageing_time 30000",
            ]
        );
    }
}
