//! Byte-stream transports to the broker.
//!
//! - TCP (plain)
//! - TLS (behind the `tls` feature)

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

#[cfg(feature = "tls")]
use tokio_rustls::client::TlsStream;

use crate::config::ClientConfig;
use crate::error::Result;

/// A unified transport that wraps different connection types.
pub enum Transport {
    /// Plain TCP stream.
    Tcp(TcpStream),
    /// TLS stream.
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Dial the broker named by `config`.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let addr = config.addr();
        debug!(%addr, tls = config.tls.is_some(), "dialing broker");

        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;

        match &config.tls {
            None => Ok(Transport::Tcp(stream)),
            #[cfg(feature = "tls")]
            Some(tls_config) => {
                let domain = tls_config.server_name.as_deref().unwrap_or(&config.host);
                let stream = tls::connect(tls_config, stream, domain).await?;
                Ok(Transport::Tls(Box::new(stream)))
            }
            #[cfg(not(feature = "tls"))]
            Some(_) => Err(crate::error::Error::InvalidConfig(
                "TLS requested but the tls feature is disabled".into(),
            )),
        }
    }

    pub fn is_tls(&self) -> bool {
        match self {
            Transport::Tcp(_) => false,
            #[cfg(feature = "tls")]
            Transport::Tls(_) => true,
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(feature = "tls")]
mod tls {
    use std::fs::File;
    use std::io::{self, BufReader};
    use std::sync::Arc;

    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    use crate::config::TlsConfig;
    use crate::error::{Error, Result};

    fn root_store(config: &TlsConfig) -> Result<RootCertStore> {
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        if let Some(path) = &config.ca_file {
            let file = File::open(path)
                .map_err(|e| Error::InvalidConfig(format!("open {}: {}", path.display(), e)))?;
            for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
                let cert = cert?;
                roots
                    .add(cert)
                    .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
            }
        }
        Ok(roots)
    }

    pub(super) async fn connect(
        config: &TlsConfig,
        stream: TcpStream,
        domain: &str,
    ) -> Result<TlsStream<TcpStream>> {
        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store(config)?)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));

        let domain = ServerName::try_from(domain.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid domain name"))?;
        Ok(connector.connect(domain, stream).await?)
    }
}
