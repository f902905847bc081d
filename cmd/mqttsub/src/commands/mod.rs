//! CLI commands module.

mod publish;
mod sub;

pub use publish::PubCommand;
pub use sub::SubCommand;

use anyhow::Context;
use mqtt_session::{ClientConfig, QoS};

use crate::Cli;

/// Build the client configuration: config file first, then flags.
pub(crate) fn load_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => ClientConfig::default(),
    };

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(keep_alive) = cli.keep_alive {
        config.keep_alive = keep_alive;
    }
    if let Some(id) = &cli.client_id {
        config.client_id = id.clone();
    }
    if let Some(username) = &cli.username {
        config.username = Some(username.clone());
    }
    if let Some(password) = &cli.password {
        config.password = Some(password.clone());
    }

    config.validate()?;
    Ok(config)
}

pub(crate) fn parse_qos(level: u8) -> anyhow::Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        n => anyhow::bail!("unsupported QoS level {} (expected 0 or 1)", n),
    }
}
