//! Subscribe command.

use std::io::Write;

use clap::Args;
use tracing::info;

use mqtt_session::Session;

use super::{load_config, parse_qos};
use crate::Cli;

/// Subscribe to one or more topic filters and print `<topic> <payload>`
/// for every message. Runs until Ctrl-C.
#[derive(Args)]
pub struct SubCommand {
    /// Topic filters (wildcards + and # allowed)
    #[arg(default_value = "test/topic")]
    topics: Vec<String>,

    /// Requested QoS (0 or 1)
    #[arg(short = 'q', long, default_value_t = 0)]
    qos: u8,
}

impl SubCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let qos = parse_qos(self.qos)?;
        let config = load_config(cli)?;
        info!(addr = %config.addr(), client_id = %config.client_id, "connecting");

        let session = Session::connect(config).await?;
        let mut run = session.spawn();

        for topic in &self.topics {
            session
                .subscribe(topic, qos, |msg| {
                    let mut out = std::io::stdout().lock();
                    writeln!(out, "{} {}", msg.topic, String::from_utf8_lossy(&msg.payload))?;
                    Ok(())
                })
                .await?;
            info!(topic = %topic, "subscribed");
        }

        // The loop only stops on its own after a fatal error.
        let interrupted = tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                true
            }
            result = &mut run => {
                result??;
                false
            }
        };

        if interrupted {
            info!("interrupted, disconnecting");
            session.disconnect().await?;
            run.await??;
        }
        Ok(())
    }
}
