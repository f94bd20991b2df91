//! Per-connection session: a receive loop and a send loop.
//!
//! Both loops run as separate tasks and share only the [`Connection`]. The
//! session is transport-agnostic; callers adapt their WebSocket library to a
//! [`Frame`] stream and sink.

use crate::connection::Connection;
use crate::error::HubError;
use crate::event::Payload;
use crate::protocol::{ClientCommand, CloseReason, Frame, ServerMessage};
use crate::registry::ConnectionRegistry;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Why the receive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveExit {
    /// The client sent a close frame or the stream ended.
    ClientClosed,
    /// Reading from the transport failed.
    TransportError,
    /// The hub requested a close.
    Cancelled,
}

/// Drives one registered connection until it closes.
pub struct Session {
    registry: Arc<ConnectionRegistry>,
    connection: Arc<Connection>,
}

impl Session {
    /// Create a session for a registered connection.
    pub fn new(registry: Arc<ConnectionRegistry>, connection: Arc<Connection>) -> Self {
        Self {
            registry,
            connection,
        }
    }

    /// Run both loops to completion and tear the connection down.
    ///
    /// Returns the reason the connection was closed.
    pub async fn run<Si, St, E>(self, sink: Si, stream: St) -> CloseReason
    where
        Si: Sink<Frame> + Send + Unpin + 'static,
        Si::Error: Display + Send,
        St: Stream<Item = Result<Frame, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let conn = self.connection;
        let registry = self.registry;
        let config = registry.config().clone();

        let Some(control_rx) = conn.take_control_receiver() else {
            warn!(connection_id = %conn.id, "Connection already has a session");
            return conn.close_reason().unwrap_or(CloseReason::ClientInitiated);
        };
        conn.attach_session();

        let welcome = ServerMessage::Welcome {
            connection_id: conn.id.clone(),
            protocol_version: conn.protocol_version,
        };
        if let Err(e) = conn.send_control(&welcome) {
            debug!(connection_id = %conn.id, error = %e, "Failed to queue welcome");
        }

        let mut send_task =
            tokio::spawn(send_loop(registry.clone(), conn.clone(), control_rx, sink));
        let receive_task = tokio::spawn(receive_loop(registry.clone(), conn.clone(), stream));

        let exit = match receive_task.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(connection_id = %conn.id, error = %e, "Receive loop panicked");
                ReceiveExit::TransportError
            }
        };
        if exit != ReceiveExit::Cancelled {
            conn.begin_draining(CloseReason::ClientInitiated);
        }

        // The send loop flushes within drain_timeout; allow the rest of the grace
        // period before abandoning it.
        let grace = config.teardown_grace.max(config.drain_timeout);
        match tokio::time::timeout(grace, &mut send_task).await {
            Ok(Ok(Err(e))) => {
                debug!(connection_id = %conn.id, error = %e, "Send loop ended with error")
            }
            Ok(Ok(Ok(()))) => {}
            Ok(Err(e)) => warn!(connection_id = %conn.id, error = %e, "Send loop panicked"),
            Err(_) => {
                warn!(connection_id = %conn.id, "Send loop stuck, aborting");
                send_task.abort();
            }
        }

        conn.mark_finished();
        let reason = conn.close_reason().unwrap_or(CloseReason::ClientInitiated);
        registry.close(&conn.id, reason).await;

        info!(connection_id = %conn.id, reason = %reason, "Session ended");
        reason
    }
}

/// Read client control messages until the client leaves or the hub closes.
async fn receive_loop<St, E>(
    registry: Arc<ConnectionRegistry>,
    conn: Arc<Connection>,
    mut stream: St,
) -> ReceiveExit
where
    St: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            _ = conn.cancelled() => return ReceiveExit::Cancelled,
            next = stream.next() => next,
        };

        match next {
            None | Some(Ok(Frame::Close(_))) => {
                debug!(connection_id = %conn.id, "Client closed connection");
                return ReceiveExit::ClientClosed;
            }
            Some(Err(e)) => {
                debug!(connection_id = %conn.id, error = %e, "Transport read failed");
                return ReceiveExit::TransportError;
            }
            Some(Ok(Frame::Other)) => {}
            Some(Ok(Frame::Text(text))) => handle_text(&registry, &conn, &text),
        }
    }
}

/// Dispatch one client control message.
fn handle_text(registry: &ConnectionRegistry, conn: &Connection, text: &str) {
    let command = match ClientCommand::parse(text) {
        Ok(cmd) => cmd,
        Err(e) => {
            debug!(connection_id = %conn.id, error = %e, "Ignoring control message");
            return;
        }
    };

    let reply = match command {
        ClientCommand::Pong => {
            conn.record_pong(Instant::now());
            return;
        }
        ClientCommand::Subscribe { events, clusters } => {
            match registry.subscribe(conn, events, clusters) {
                Ok((events, clusters)) => ServerMessage::Subscribed {
                    events,
                    clusters: clusters.into_iter().collect(),
                },
                Err(e) => {
                    debug!(connection_id = %conn.id, error = %e, "Subscribe rejected");
                    ServerMessage::error(&e)
                }
            }
        }
        ClientCommand::Unsubscribe { events } => {
            registry.unsubscribe(conn, &events);
            ServerMessage::Unsubscribed { events }
        }
    };

    if let Err(e) = conn.send_control(&reply) {
        debug!(connection_id = %conn.id, error = %e, "Dropped control reply");
    }
}

/// Write control messages and buffered events until the connection drains.
async fn send_loop<Si>(
    registry: Arc<ConnectionRegistry>,
    conn: Arc<Connection>,
    mut control: mpsc::Receiver<Payload>,
    mut sink: Si,
) -> Result<(), HubError>
where
    Si: Sink<Frame> + Unpin,
    Si::Error: Display,
{
    let config = registry.config();
    let idle = config.idle_poll_interval;
    let result = deliver(&registry, &conn, &mut control, &mut sink, idle).await;
    if result.is_err() {
        conn.begin_draining(CloseReason::ClientInitiated);
        return result;
    }

    // Draining: flush what is left, then say goodbye
    let flush = async {
        while let Ok(payload) = control.try_recv() {
            write(&mut sink, payload).await?;
        }
        while let Some(dequeued) = conn.dequeue() {
            write(&mut sink, dequeued.payload).await?;
        }
        Ok::<(), HubError>(())
    };
    match tokio::time::timeout(config.drain_timeout, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            let abandoned = conn.buffer().clear();
            warn!(connection_id = %conn.id, abandoned = abandoned, "Drain timed out");
        }
    }

    let reason = conn.close_reason().unwrap_or(CloseReason::ClientInitiated);
    let goodbye = async {
        sink.send(Frame::Close(Some(reason.frame()))).await?;
        sink.close().await
    };
    if let Ok(Err(e)) = tokio::time::timeout(config.drain_timeout, goodbye).await {
        debug!(connection_id = %conn.id, error = %e, "Close frame not delivered");
    }
    Ok(())
}

/// Main delivery loop; returns when the connection is cancelled.
async fn deliver<Si>(
    registry: &ConnectionRegistry,
    conn: &Connection,
    control: &mut mpsc::Receiver<Payload>,
    sink: &mut Si,
    idle: std::time::Duration,
) -> Result<(), HubError>
where
    Si: Sink<Frame> + Unpin,
    Si::Error: Display,
{
    let metrics = registry.metrics_sink();
    loop {
        if conn.is_cancelled() {
            return Ok(());
        }

        if let Ok(payload) = control.try_recv() {
            write(sink, payload).await?;
            continue;
        }

        if let Some(dequeued) = conn.dequeue() {
            if let Some(transition) = dequeued.transition {
                metrics.watermark_crossed(&conn.id, transition);
            }
            write(sink, dequeued.payload).await?;
            continue;
        }

        tokio::select! {
            _ = conn.cancelled() => return Ok(()),
            Some(payload) = control.recv() => write(sink, payload).await?,
            _ = tokio::time::sleep(idle) => {}
        }
    }
}

async fn write<Si>(sink: &mut Si, payload: Payload) -> Result<(), HubError>
where
    Si: Sink<Frame> + Unpin,
    Si::Error: Display,
{
    sink.send(Frame::Text(payload))
        .await
        .map_err(|e| HubError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferConfig, HubConfig};
    use crate::event::{Event, EventType};
    use crate::router::EventRouter;
    use futures::channel::mpsc as fmpsc;
    use pulse_auth::Identity;
    use std::time::Duration;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        conn: Arc<Connection>,
        /// Frames the client sends.
        to_hub: fmpsc::UnboundedSender<Result<Frame, std::io::Error>>,
        /// Frames the hub writes.
        from_hub: fmpsc::UnboundedReceiver<Frame>,
        session: tokio::task::JoinHandle<CloseReason>,
    }

    fn start(config: HubConfig) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new(config));
        let conn = registry.register(Identity::new("alice"), 1).unwrap();
        let (to_hub, hub_rx) = fmpsc::unbounded();
        let (hub_tx, from_hub) = fmpsc::unbounded();
        let session = tokio::spawn(Session::new(registry.clone(), conn.clone()).run(hub_tx, hub_rx));
        Harness {
            registry,
            conn,
            to_hub,
            from_hub,
            session,
        }
    }

    fn test_config() -> HubConfig {
        HubConfig {
            idle_poll_interval: Duration::from_millis(5),
            drain_timeout: Duration::from_millis(200),
            teardown_grace: Duration::from_millis(500),
            ..Default::default()
        }
    }

    async fn next_json(rx: &mut fmpsc::UnboundedReceiver<Frame>) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended");
        match frame {
            Frame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    fn send(h: &Harness, text: &str) {
        h.to_hub.unbounded_send(Ok(Frame::text(text))).unwrap();
    }

    #[tokio::test]
    async fn test_welcome_subscribe_and_deliver() {
        let mut h = start(test_config());

        let welcome = next_json(&mut h.from_hub).await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["connection_id"], h.conn.id.as_str());

        send(&h, r#"{"type":"subscribe","events":["alert"],"clusters":["c1"]}"#);
        let ack = next_json(&mut h.from_hub).await;
        assert_eq!(ack["type"], "subscribed");
        assert_eq!(ack["events"][0], "alert");
        assert_eq!(ack["clusters"][0], "c1");

        let router = EventRouter::new(h.registry.clone());
        router.route(&Event::new(EventType::ALERT, "c1", serde_json::json!({"n": 1})));
        let event = next_json(&mut h.from_hub).await;
        assert_eq!(event["type"], "event");
        assert_eq!(event["payload"]["n"], 1);

        h.to_hub.unbounded_send(Ok(Frame::Close(None))).unwrap();
        assert_eq!(h.session.await.unwrap(), CloseReason::ClientInitiated);
        assert!(h.registry.get(&h.conn.id).is_none());
        assert!(!h.registry.subscriptions().references(&h.conn.id));
    }

    #[tokio::test]
    async fn test_malformed_message_is_ignored() {
        let mut h = start(test_config());
        let _welcome = next_json(&mut h.from_hub).await;

        send(&h, "this is not json");
        send(&h, r#"{"type":"launch_missiles"}"#);
        send(&h, r#"{"type":"unsubscribe","events":["alert"]}"#);

        let reply = next_json(&mut h.from_hub).await;
        assert_eq!(reply["type"], "unsubscribed");
        assert!(h.registry.get(&h.conn.id).is_some());

        drop(h.to_hub);
        h.session.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscription_limit_reports_error() {
        let mut h = start(HubConfig {
            max_subscriptions_per_connection: 1,
            ..test_config()
        });
        let _welcome = next_json(&mut h.from_hub).await;

        send(&h, r#"{"type":"subscribe","events":["alert","status"]}"#);
        let reply = next_json(&mut h.from_hub).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["code"], "subscription_limit");

        drop(h.to_hub);
        h.session.await.unwrap();
    }

    #[tokio::test]
    async fn test_pong_resets_heartbeat() {
        let mut h = start(test_config());
        let _welcome = next_json(&mut h.from_hub).await;

        let cfg = h.registry.config().heartbeat;
        h.conn.heartbeat_tick(Instant::now(), &cfg);
        h.conn
            .heartbeat_tick(Instant::now() + cfg.interval, &cfg);
        assert_eq!(h.conn.heartbeat().missed_pongs(), 1);

        send(&h, r#"{"type":"pong"}"#);
        // Follow with a command that replies so we know the pong was processed
        send(&h, r#"{"type":"unsubscribe","events":[]}"#);
        let _ = next_json(&mut h.from_hub).await;
        assert_eq!(h.conn.heartbeat().missed_pongs(), 0);

        drop(h.to_hub);
        h.session.await.unwrap();
    }

    #[tokio::test]
    async fn test_hub_close_flushes_and_sends_reason() {
        let mut h = start(HubConfig {
            buffer: BufferConfig::with_capacity(100),
            ..test_config()
        });
        let _welcome = next_json(&mut h.from_hub).await;

        send(&h, r#"{"type":"subscribe","events":["status"]}"#);
        let _ack = next_json(&mut h.from_hub).await;

        let router = EventRouter::new(h.registry.clone());
        for i in 0..3 {
            router.route(&Event::new(EventType::STATUS, "c1", serde_json::json!(i)));
        }

        assert!(h.registry.close(&h.conn.id, CloseReason::HeartbeatTimeout).await);

        let mut frames = Vec::new();
        while let Some(frame) = h.from_hub.next().await {
            frames.push(frame);
        }
        let close = frames.last().unwrap();
        assert_eq!(
            close,
            &Frame::Close(Some(CloseReason::HeartbeatTimeout.frame()))
        );
        let texts = frames.iter().filter(|f| matches!(f, Frame::Text(_))).count();
        assert_eq!(texts, 3);

        assert_eq!(h.session.await.unwrap(), CloseReason::HeartbeatTimeout);
    }

    #[tokio::test]
    async fn test_transport_error_ends_session() {
        let mut h = start(test_config());
        let _welcome = next_json(&mut h.from_hub).await;

        h.to_hub
            .unbounded_send(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "reset")))
            .unwrap();
        assert_eq!(h.session.await.unwrap(), CloseReason::ClientInitiated);
        assert_eq!(h.registry.connection_count(), 0);
    }
}
