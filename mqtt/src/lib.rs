//! MQTT 3.1.1 session client.
//!
//! A [`Session`] keeps one connection to a broker alive: it performs the
//! CONNECT/CONNACK handshake, sends keep-alive pings, delivers QoS 0 and
//! QoS 1 publishes, routes incoming messages through a [`ServeMux`] and
//! reconnects with exponential backoff, replaying every subscription.
//!
//! # Example
//!
//! ```no_run
//! use mqtt_session::{ClientConfig, QoS, Session};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::new("localhost", 1883).with_keep_alive(60);
//!     let session = Session::connect(config).await?;
//!     let run = session.spawn();
//!
//!     session
//!         .subscribe("test/topic", QoS::AtMostOnce, |msg| {
//!             println!("{} {}", msg.topic, String::from_utf8_lossy(&msg.payload));
//!             Ok(())
//!         })
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     session.disconnect().await?;
//!     run.await??;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod config;
mod error;
pub mod pending;
pub mod protocol;
mod serve_mux;
mod session;
pub mod topic;
mod transport;
mod trie;
mod types;

pub use config::{ClientConfig, ReconnectConfig, TlsConfig};
pub use error::{Error, Result};
pub use serve_mux::{Handler, HandlerFunc, Message, ServeMux, handler_fn};
pub use session::{Dialer, Session, Subscription};
pub use transport::Transport;
pub use trie::Trie;
pub use types::{ConnectReturnCode, ConnectionState, QoS};

/// Re-export commonly used items
pub mod prelude {
    pub use crate::{
        ClientConfig, ConnectionState, Dialer, Error, Handler, Message, QoS, ReconnectConfig,
        Result, ServeMux, Session,
    };
}
