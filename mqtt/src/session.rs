//! The broker session.
//!
//! A [`Session`] owns one connection to the broker. [`Session::run`] is the
//! only reader of the socket; it multiplexes inbound packets, the outbound
//! request queue and the keep-alive timer, and reconnects with exponential
//! backoff when the transport fails. Callers publish and subscribe from any
//! task through cheap clones of the session.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::pending::{Ack, AckKind, PendingAcks, PendingState};
use crate::protocol::{
    Connect, Packet, PubAck, Publish, Subscribe, SubscribeFilter, SubscribeReturnCode, Unsubscribe,
    read_packet, write_packet,
};
use crate::serve_mux::{Handler, Message, ServeMux, handler_fn};
use crate::topic;
use crate::transport::Transport;
use crate::types::{ConnectReturnCode, ConnectionState, QoS};

/// An active subscription as the session will replay it after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

type ConnectionUpFn = Box<dyn Fn() + Send + Sync>;
type ConnectionLostFn = Box<dyn Fn(&Error) + Send + Sync>;

/// Builds a [`Session`]: configuration plus optional mux and observers.
pub struct Dialer {
    config: ClientConfig,
    serve_mux: Option<Arc<ServeMux>>,
    on_connection_up: Option<ConnectionUpFn>,
    on_connection_lost: Option<ConnectionLostFn>,
}

impl Dialer {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            serve_mux: None,
            on_connection_up: None,
            on_connection_lost: None,
        }
    }

    /// Dispatch through an existing mux instead of a fresh one.
    pub fn with_serve_mux(mut self, mux: Arc<ServeMux>) -> Self {
        self.serve_mux = Some(mux);
        self
    }

    /// Called after every successful CONNACK, including reconnects.
    pub fn with_on_connection_up<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connection_up = Some(Box::new(f));
        self
    }

    /// Called with the cause whenever an established connection drops.
    pub fn with_on_connection_lost<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_connection_lost = Some(Box::new(f));
        self
    }

    /// Connect to the broker and complete the CONNECT/CONNACK handshake.
    pub async fn dial(self) -> Result<Session> {
        self.config.validate()?;

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity);
        let session = Session {
            inner: Arc::new(Inner {
                mux: self.serve_mux.unwrap_or_default(),
                state: watch::Sender::new(ConnectionState::Disconnected),
                running: watch::Sender::new(false),
                subscriptions: Mutex::new(Vec::new()),
                pending: PendingAcks::new(),
                conn: Mutex::new(None),
                reader: Mutex::new(None),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                cancel: CancellationToken::new(),
                on_connection_up: self.on_connection_up,
                on_connection_lost: self.on_connection_lost,
                config: self.config,
            }),
        };

        session.set_state(ConnectionState::Connecting);
        if let Err(e) = session.establish().await {
            session.set_state(ConnectionState::Disconnected);
            let addr = session.inner.config.addr();
            return Err(match e {
                e if e.is_transport() => Error::Connect(format!("{}: {}", addr, e)),
                e => e,
            });
        }
        Ok(session)
    }
}

/// One side of the socket plus the bytes read but not yet decoded.
struct ReadState {
    reader: ReadHalf<Transport>,
    buf: BytesMut,
}

/// The write side of one established connection.
struct Connection {
    writer: tokio::sync::Mutex<WriteHalf<Transport>>,
    keep_alive: Option<Duration>,
    write_timeout: Duration,
    last_sent: Mutex<Instant>,
}

impl Connection {
    fn new(writer: WriteHalf<Transport>, keep_alive: Option<Duration>, write_timeout: Duration) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            keep_alive,
            write_timeout,
            last_sent: Mutex::new(Instant::now()),
        }
    }

    /// Write one packet. Waiting for the writer lock counts against the
    /// write timeout; expiry is a transport failure.
    async fn write(&self, packet: &Packet) -> Result<()> {
        let written = time::timeout(self.write_timeout, async {
            let mut writer = self.writer.lock().await;
            write_packet(&mut *writer, packet).await
        })
        .await;
        match written {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("writing {} stalled for {:?}", packet.name(), self.write_timeout),
                )));
            }
        }
        *self.last_sent.lock() = Instant::now();
        trace!(packet = packet.name(), "sent");
        Ok(())
    }

    fn last_sent(&self) -> Instant {
        *self.last_sent.lock()
    }

    async fn shutdown(&self) {
        let closed = time::timeout(self.write_timeout, async {
            self.writer.lock().await.shutdown().await
        })
        .await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "transport shutdown failed"),
            Err(_) => debug!("transport shutdown stalled, dropping it"),
        }
    }
}

struct Inner {
    config: ClientConfig,
    mux: Arc<ServeMux>,
    state: watch::Sender<ConnectionState>,
    running: watch::Sender<bool>,
    subscriptions: Mutex<Vec<Subscription>>,
    pending: PendingAcks,
    conn: Mutex<Option<Arc<Connection>>>,
    reader: Mutex<Option<ReadState>>,
    outbound_tx: mpsc::Sender<Packet>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    cancel: CancellationToken,
    on_connection_up: Option<ConnectionUpFn>,
    on_connection_lost: Option<ConnectionLostFn>,
}

/// Clears the running flag and hands the outbound queue back when `run` ends,
/// including when its future is dropped.
struct RunGuard<'a> {
    inner: &'a Inner,
    outbound: Option<mpsc::Receiver<Packet>>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Some(rx) = self.outbound.take() {
            *self.inner.outbound_rx.lock() = Some(rx);
        }
        self.inner.running.send_replace(false);
    }
}

/// A persistent MQTT session with one broker.
///
/// # Example
///
/// ```no_run
/// use mqtt_session::{ClientConfig, QoS, Session};
///
/// #[tokio::main]
/// async fn main() -> mqtt_session::Result<()> {
///     let session = Session::connect(ClientConfig::new("localhost", 1883)).await?;
///     let loop_handle = session.spawn();
///
///     session
///         .subscribe("test/topic", QoS::AtMostOnce, |msg| {
///             println!("{} {}", msg.topic, msg.payload_str().unwrap_or_default());
///             Ok(())
///         })
///         .await?;
///     session.publish("test/topic", "hello", QoS::AtLeastOnce).await?;
///
///     session.disconnect().await?;
///     loop_handle.await.ok();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Connect with default mux and no observers.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Dialer::new(config).dial().await
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Snapshot of the active subscriptions.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.subscriptions.lock().clone()
    }

    pub fn serve_mux(&self) -> &Arc<ServeMux> {
        &self.inner.mux
    }

    /// Run the session loop on a new task.
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let session = self.clone();
        tokio::spawn(async move { session.run().await })
    }

    /// Subscribe `filter` and invoke `f` for every matching message.
    pub async fn subscribe<F>(&self, filter: &str, qos: QoS, f: F) -> Result<()>
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe_handler(filter, qos, handler_fn(f)).await
    }

    /// Subscribe `filter` with a shared handler.
    ///
    /// The handler is registered before SUBSCRIBE goes out and removed again
    /// if the broker rejects the filter or the SUBACK does not arrive in time.
    pub async fn subscribe_handler(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        topic::validate_filter(filter)?;
        self.ensure_connected()?;

        self.inner.mux.handle(filter, handler.clone())?;
        let previous = self.upsert_subscription(filter, qos);

        let result = self.send_subscribe(filter, qos).await;
        if result.is_err() {
            self.inner.mux.remove_handler(filter, &handler);
            self.restore_subscription(filter, previous);
        }
        result
    }

    async fn send_subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        let deadline = Instant::now() + self.inner.config.subscribe_timeout();
        let (pkid, rx) = self.inner.pending.register_subscribe(filter)?;
        let packet = Packet::Subscribe(Subscribe {
            pkid,
            filters: vec![SubscribeFilter {
                path: filter.to_string(),
                qos,
            }],
        });
        if let Err(e) = self.enqueue(packet, deadline).await {
            self.inner.pending.remove(pkid);
            return Err(e);
        }

        match self.wait_ack(pkid, rx, "SUBACK", deadline).await? {
            Ack::SubAck(codes) => match codes.first() {
                Some(SubscribeReturnCode::Success(granted)) => {
                    debug!(filter, ?granted, "subscribed");
                    Ok(())
                }
                Some(SubscribeReturnCode::Failure) => Err(Error::Subscribe {
                    filter: filter.to_string(),
                    reason: "rejected by broker".into(),
                }),
                None => Err(Error::Protocol("SUBACK without return codes".into())),
            },
            other => Err(Error::Protocol(format!("expected SUBACK, got {:?}", other))),
        }
    }

    /// Drop the subscription and its handlers, then tell the broker.
    pub async fn unsubscribe(&self, filter: &str) -> Result<()> {
        topic::validate_filter(filter)?;
        self.ensure_connected()?;

        self.inner.mux.remove(filter);
        self.inner.subscriptions.lock().retain(|s| s.filter != filter);

        let deadline = Instant::now() + self.inner.config.subscribe_timeout();
        let (pkid, rx) = self.inner.pending.register(AckKind::Unsubscribe)?;
        let packet = Packet::Unsubscribe(Unsubscribe {
            pkid,
            filters: vec![filter.to_string()],
        });
        if let Err(e) = self.enqueue(packet, deadline).await {
            self.inner.pending.remove(pkid);
            return Err(e);
        }
        self.wait_ack(pkid, rx, "UNSUBACK", deadline).await?;
        debug!(filter, "unsubscribed");
        Ok(())
    }

    /// Publish without the retain flag.
    ///
    /// QoS 0 returns once the packet is queued. QoS 1 returns on PUBACK; if
    /// none arrives within the publish timeout the packet is sent once more
    /// with DUP set before failing with [`Error::PublishTimeout`].
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS) -> Result<()> {
        self.publish_with_retain(topic, payload, qos, false).await
    }

    pub async fn publish_with_retain(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        topic::validate_topic(topic)?;
        self.ensure_connected()?;

        let mut publish = Publish {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain,
            dup: false,
            pkid: 0,
        };

        let wait = self.inner.config.publish_timeout();
        if qos == QoS::AtMostOnce {
            return self.enqueue(Packet::Publish(publish), Instant::now() + wait).await;
        }

        let (pkid, mut rx) = self.inner.pending.register(AckKind::Publish)?;
        publish.pkid = pkid;

        // Each attempt gets `wait` for queueing plus the PUBACK.
        let mut queued = false;
        for _ in 0..2 {
            if queued {
                publish.dup = true;
                debug!(pkid, topic, "no PUBACK, retransmitting with DUP");
            }
            let deadline = Instant::now() + wait;
            match self.enqueue(Packet::Publish(publish.clone()), deadline).await {
                Ok(()) => queued = true,
                Err(Error::Timeout(_)) => continue,
                Err(e) => {
                    self.inner.pending.remove(pkid);
                    return Err(e);
                }
            }
            match time::timeout_at(deadline, &mut rx).await {
                Ok(Ok(Ok(_))) => return Ok(()),
                Ok(Ok(Err(e))) => return Err(e),
                Ok(Err(_)) => return Err(Error::Cancelled),
                Err(_) => {}
            }
        }

        self.inner.pending.remove(pkid);
        Err(Error::PublishTimeout { packet_id: pkid })
    }

    /// Close the session: send DISCONNECT, shut the transport down and fail
    /// every pending operation with [`Error::Cancelled`].
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.cancel.cancel();

        if *self.inner.running.borrow() {
            let mut running = self.inner.running.subscribe();
            let stopped = time::timeout(
                self.inner.config.connect_timeout(),
                running.wait_for(|r| !*r),
            )
            .await
            .is_ok();
            if stopped {
                return Ok(());
            }
            warn!("session loop did not stop in time, closing transport");
        }

        self.shutdown().await;
        Ok(())
    }

    /// Drive the session until [`Session::disconnect`] or a fatal error.
    ///
    /// Transport failures are retried per the reconnect policy and replay
    /// every subscription on the new connection. Protocol errors and an
    /// exhausted retry budget end the loop with an error.
    pub async fn run(&self) -> Result<()> {
        if self.inner.running.send_replace(true) {
            return Err(Error::AlreadyRunning);
        }
        let outbound = self.inner.outbound_rx.lock().take();
        let mut guard = RunGuard {
            inner: &self.inner,
            outbound,
        };
        let Some(outbound) = guard.outbound.as_mut() else {
            return Err(Error::AlreadyRunning);
        };

        if self.inner.cancel.is_cancelled() {
            self.shutdown().await;
            return Ok(());
        }
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }

        let mut backoff = Backoff::new(&self.inner.config.reconnect);
        let mut replay = false;
        loop {
            let conn = self.inner.conn.lock().clone();
            let read = self.inner.reader.lock().take();
            let result = match (conn, read) {
                (Some(conn), Some(mut read)) => self.serve(&conn, &mut read, outbound, replay).await,
                _ => Err(Error::ConnectionClosed),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transport() => {
                    self.connection_lost(&e).await;
                    if !self.inner.config.reconnect.enabled {
                        self.terminate(&e).await;
                        return Err(e);
                    }
                    match self.reconnect(&mut backoff).await {
                        Ok(true) => replay = true,
                        Ok(false) => {
                            self.shutdown().await;
                            return Ok(());
                        }
                        Err(e) => {
                            error!(error = %e, "giving up on broker");
                            self.terminate(&e).await;
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "session failed");
                    self.terminate(&e).await;
                    return Err(e);
                }
            }
        }
    }

    async fn serve(
        &self,
        conn: &Connection,
        read: &mut ReadState,
        outbound: &mut mpsc::Receiver<Packet>,
        replay: bool,
    ) -> Result<()> {
        if replay {
            self.resubscribe(conn).await?;
        }

        let config = &self.inner.config;
        let mut ping_sent: Option<Instant> = None;

        loop {
            let deadline = match ping_sent {
                Some(at) => Some(at + config.ping_timeout()),
                None => conn.keep_alive.map(|interval| conn.last_sent() + interval),
            };
            let keep_alive = async move {
                match deadline {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                _ = self.inner.cancel.cancelled() => {
                    // Queued packets go out ahead of DISCONNECT.
                    while let Ok(packet) = outbound.try_recv() {
                        if let Err(e) = conn.write(&packet).await {
                            debug!(error = %e, "dropping queued packets");
                            break;
                        }
                    }
                    self.shutdown().await;
                    return Ok(());
                }

                packet = read_packet(&mut read.reader, &mut read.buf, config.max_packet_size) => {
                    self.handle_incoming(conn, packet?, &mut ping_sent).await?;
                }

                Some(packet) = outbound.recv() => {
                    conn.write(&packet).await?;
                    if let Some(pkid) = acked_pkid(&packet) {
                        self.inner.pending.mark_written(pkid);
                    }
                }

                _ = keep_alive => {
                    if ping_sent.is_some() {
                        return Err(Error::KeepAliveTimeout(config.ping_timeout()));
                    }
                    conn.write(&Packet::PingReq).await?;
                    ping_sent = Some(Instant::now());
                }
            }
        }
    }

    async fn handle_incoming(
        &self,
        conn: &Connection,
        packet: Packet,
        ping_sent: &mut Option<Instant>,
    ) -> Result<()> {
        trace!(packet = packet.name(), "received");
        match packet {
            Packet::Publish(publish) => {
                let qos = publish.qos;
                let pkid = publish.pkid;
                let msg = Message::from(publish);
                let handled = self.inner.mux.handle_message(&msg);
                debug!(topic = %msg.topic, handlers = handled, "dispatched");
                if qos == QoS::AtLeastOnce {
                    conn.write(&Packet::PubAck(PubAck { pkid })).await?;
                }
            }
            Packet::PubAck(ack) => {
                self.inner.pending.complete(ack.pkid, Ack::PubAck);
            }
            Packet::SubAck(ack) => {
                if ack.return_codes.contains(&SubscribeReturnCode::Failure) {
                    warn!(pkid = ack.pkid, "broker rejected subscription");
                }
                self.inner.pending.complete(ack.pkid, Ack::SubAck(ack.return_codes));
            }
            Packet::UnsubAck(ack) => {
                self.inner.pending.complete(ack.pkid, Ack::UnsubAck);
            }
            Packet::PingResp => {
                *ping_sent = None;
            }
            other => {
                return Err(Error::Protocol(format!("unexpected {} from broker", other.name())));
            }
        }
        Ok(())
    }

    /// CONNECT/CONNACK on a fresh transport. On success the connection is
    /// installed and the state is Connected.
    async fn establish(&self) -> Result<()> {
        let config = &self.inner.config;

        let (conn, read, session_present) = time::timeout(config.connect_timeout(), handshake(config))
            .await
            .map_err(|_| {
                Error::Connect(format!(
                    "no CONNACK from {} within {:?}",
                    config.addr(),
                    config.connect_timeout()
                ))
            })??;

        *self.inner.conn.lock() = Some(Arc::new(conn));
        *self.inner.reader.lock() = Some(read);
        self.set_state(ConnectionState::Connected);
        info!(addr = %config.addr(), client_id = %config.client_id, session_present, "connected");

        if let Some(f) = &self.inner.on_connection_up {
            f();
        }
        Ok(())
    }

    /// Back off and redial until connected (`true`), cancelled (`false`) or
    /// out of retries.
    async fn reconnect(&self, backoff: &mut Backoff) -> Result<bool> {
        let cancel = &self.inner.cancel;
        loop {
            let Some(delay) = backoff.next_delay() else {
                return Err(Error::Connect(format!(
                    "gave up after {} reconnect attempts",
                    backoff.attempts()
                )));
            };
            self.set_state(ConnectionState::Reconnecting);
            info!(attempt = backoff.attempts(), ?delay, "reconnecting");

            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                _ = time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                result = self.establish() => result,
            };
            match result {
                Ok(()) => {
                    backoff.reset();
                    return Ok(true);
                }
                Err(e) => warn!(error = %e, "reconnect attempt failed"),
            }
        }
    }

    /// Replay every subscription once on a new connection.
    ///
    /// A filter whose caller is still waiting for its SUBACK is replayed
    /// under the caller's packet id, so that SUBACK completes the call. Other
    /// replays use untracked ids; rejections are logged when they arrive.
    async fn resubscribe(&self, conn: &Connection) -> Result<()> {
        self.inner.pending.drop_untracked();
        let subscriptions = self.subscriptions();
        for sub in &subscriptions {
            let pkid = match self.inner.pending.tracked_subscribe(&sub.filter) {
                // Still in the outbound queue; it goes out on this connection.
                Some((_, PendingState::Sent)) => continue,
                Some((pkid, PendingState::AckPending)) => pkid,
                None => self.inner.pending.register_untracked(AckKind::Subscribe)?,
            };
            conn.write(&Packet::Subscribe(Subscribe {
                pkid,
                filters: vec![SubscribeFilter {
                    path: sub.filter.clone(),
                    qos: sub.qos,
                }],
            }))
            .await?;
            self.inner.pending.mark_written(pkid);
        }
        if !subscriptions.is_empty() {
            info!(count = subscriptions.len(), "resubscribed");
        }
        Ok(())
    }

    async fn connection_lost(&self, err: &Error) {
        warn!(error = %err, "connection lost");
        let conn = self.inner.conn.lock().take();
        self.inner.reader.lock().take();
        if let Some(conn) = conn {
            conn.shutdown().await;
        }
        self.set_state(ConnectionState::Disconnected);
        if let Some(f) = &self.inner.on_connection_lost {
            f(err);
        }
    }

    /// Graceful close: DISCONNECT, transport shutdown, waiters cancelled.
    async fn shutdown(&self) {
        let conn = self.inner.conn.lock().take();
        self.inner.reader.lock().take();

        if let Some(conn) = conn {
            self.set_state(ConnectionState::Disconnecting);
            if let Err(e) = conn.write(&Packet::Disconnect).await {
                debug!(error = %e, "failed to send DISCONNECT");
            }
            conn.shutdown().await;
            info!("disconnected");
        }

        let cancelled = self.inner.pending.fail_all(|| Error::Cancelled);
        if cancelled > 0 {
            debug!(cancelled, "cancelled pending operations");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Abrupt close after a fatal error. Pending callers get the cause.
    async fn terminate(&self, err: &Error) {
        self.inner.cancel.cancel();
        let conn = self.inner.conn.lock().take();
        self.inner.reader.lock().take();
        if let Some(conn) = conn {
            conn.shutdown().await;
        }

        match err {
            Error::Protocol(msg) => self.inner.pending.fail_all(|| Error::Protocol(msg.clone())),
            other => {
                let msg = other.to_string();
                self.inner.pending.fail_all(|| Error::Connect(msg.clone()))
            }
        };
        self.set_state(ConnectionState::Disconnected);
    }

    /// Queue `packet` for the run loop, giving up at `deadline` when the
    /// queue stays full.
    async fn enqueue(&self, packet: Packet, deadline: Instant) -> Result<()> {
        let name = packet.name();
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Error::Cancelled),
            sent = time::timeout_at(deadline, self.inner.outbound_tx.send(packet)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(Error::Cancelled),
                Err(_) => Err(Error::Timeout(format!("outbound queue full, {} not queued", name))),
            },
        }
    }

    async fn wait_ack(
        &self,
        pkid: u16,
        rx: oneshot::Receiver<Result<Ack>>,
        what: &str,
        deadline: Instant,
    ) -> Result<Ack> {
        let wait = self.inner.config.subscribe_timeout();
        match time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.inner.pending.remove(pkid);
                Err(Error::Timeout(format!(
                    "no {} for packet {} within {:?}",
                    what, pkid, wait
                )))
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    fn upsert_subscription(&self, filter: &str, qos: QoS) -> Option<QoS> {
        let mut subs = self.inner.subscriptions.lock();
        match subs.iter_mut().find(|s| s.filter == filter) {
            Some(sub) => Some(std::mem::replace(&mut sub.qos, qos)),
            None => {
                subs.push(Subscription {
                    filter: filter.to_string(),
                    qos,
                });
                None
            }
        }
    }

    fn restore_subscription(&self, filter: &str, previous: Option<QoS>) {
        let mut subs = self.inner.subscriptions.lock();
        match previous {
            Some(qos) => {
                if let Some(sub) = subs.iter_mut().find(|s| s.filter == filter) {
                    sub.qos = qos;
                }
            }
            None => subs.retain(|s| s.filter != filter),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "state changed");
        }
    }
}

/// Dial, send CONNECT and wait for an accepting CONNACK.
async fn handshake(config: &ClientConfig) -> Result<(Connection, ReadState, bool)> {
    let transport = Transport::connect(config).await?;
    let (mut reader, writer) = tokio::io::split(transport);
    let conn = Connection::new(writer, config.keep_alive_interval(), config.write_timeout());

    conn.write(&Packet::Connect(Connect {
        client_id: config.client_id.clone(),
        keep_alive: config.keep_alive,
        clean_session: config.clean_session,
        username: config.username.clone(),
        password: config.password.clone().map(Bytes::from),
    }))
    .await?;

    let mut buf = BytesMut::with_capacity(4096);
    match read_packet(&mut reader, &mut buf, config.max_packet_size).await? {
        Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Accepted => {
            Ok((conn, ReadState { reader, buf }, ack.session_present))
        }
        Packet::ConnAck(ack) => Err(Error::ConnectionRefused(ack.code)),
        other => Err(Error::Protocol(format!("expected CONNACK, got {}", other.name()))),
    }
}

/// Packet id of an outbound packet that expects an acknowledgement.
fn acked_pkid(packet: &Packet) -> Option<u16> {
    match packet {
        Packet::Publish(p) if p.qos == QoS::AtLeastOnce => Some(p.pkid),
        Packet::Subscribe(s) => Some(s.pkid),
        Packet::Unsubscribe(u) => Some(u.pkid),
        _ => None,
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id())
            .field("state", &self.state())
            .field("subscriptions", &self.inner.subscriptions.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acked_pkid() {
        let publish = |qos| {
            Packet::Publish(Publish {
                topic: "t".into(),
                payload: Bytes::new(),
                qos,
                retain: false,
                dup: false,
                pkid: if qos == QoS::AtLeastOnce { 4 } else { 0 },
            })
        };
        assert_eq!(acked_pkid(&publish(QoS::AtLeastOnce)), Some(4));
        assert_eq!(acked_pkid(&publish(QoS::AtMostOnce)), None);
        assert_eq!(acked_pkid(&Packet::PingReq), None);
        assert_eq!(
            acked_pkid(&Packet::Unsubscribe(Unsubscribe {
                pkid: 9,
                filters: vec!["a".into()],
            })),
            Some(9)
        );
    }

    #[tokio::test]
    async fn test_dial_invalid_config() {
        let config = ClientConfig::new("localhost", 1883).with_outbound_capacity(0);
        let err = Session::connect(config).await.err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
