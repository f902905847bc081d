//! Publish command.

use clap::Args;
use tracing::info;

use mqtt_session::Session;

use super::{load_config, parse_qos};
use crate::Cli;

/// Publish one message and disconnect.
///
/// With QoS 1 the command waits for the broker's PUBACK.
#[derive(Args)]
pub struct PubCommand {
    /// Topic name (no wildcards)
    #[arg(default_value = "test/topic")]
    topic: String,

    /// Message payload
    #[arg(short = 'm', long, default_value = "hello")]
    message: String,

    /// QoS (0 or 1)
    #[arg(short = 'q', long, default_value_t = 0)]
    qos: u8,

    /// Ask the broker to retain the message
    #[arg(short = 'r', long)]
    retain: bool,
}

impl PubCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let qos = parse_qos(self.qos)?;
        let config = load_config(cli)?;

        let session = Session::connect(config).await?;
        let run = session.spawn();

        let result = session
            .publish_with_retain(&self.topic, self.message.clone(), qos, self.retain)
            .await;
        if result.is_ok() {
            info!(topic = %self.topic, ?qos, bytes = self.message.len(), "published");
        }

        // QoS 0 returns once queued; disconnecting lets the loop flush it.
        session.disconnect().await?;
        run.await??;
        Ok(result?)
    }
}
