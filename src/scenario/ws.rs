#![forbid(unsafe_code)]

// STOMP-over-WebSocket scenario: connect, handshake, subscribe to the
// room topic, push a paced burst of chat messages, then linger to count the
// broadcast echoes. The driver is generic over the frame transport so the
// whole flow runs against an in-memory peer in tests.

use crate::metrics::Registry;
use crate::scheduler::WorkerContext;
use crate::stomp::{Frame, SessionState, StompSession};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct WsOptions {
    pub messages_per_connection: u32,
    pub message_pacing: Duration,
    pub drain_wait: Duration,
    /// Hard ceiling on the whole connect-send-drain sequence.
    pub connect_timeout: Duration,
}

pub struct WsScenario {
    ws_url: String,
    options: WsOptions,
}

impl WsScenario {
    pub fn new(ws_url: impl Into<String>, options: WsOptions) -> Self {
        Self {
            ws_url: ws_url.into(),
            options,
        }
    }

    pub async fn iteration(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let fixtures = &ctx.fixtures;
        if !fixtures.is_usable() {
            return Ok(());
        }
        let Some(room_index) = ctx.fixture_index(fixtures.rooms.len()) else {
            return Ok(());
        };
        let room = &fixtures.rooms[room_index];
        let Some((user1, user2)) = room.direct_pair() else {
            return Ok(());
        };
        // Even workers speak as the room creator, odd workers as the target,
        // so both ends of each pair stay active.
        let user_index = if ctx.vu % 2 == 0 { user1 } else { user2 };
        let Some(user) = fixtures.users.get(user_index) else {
            return Ok(());
        };

        let mut transport = match connect_async(self.ws_url.as_str()).await {
            Ok((transport, _response)) => {
                ctx.metrics.check("ws connected", true);
                transport
            }
            Err(e) => {
                ctx.metrics.check("ws connected", false);
                return Err(e.into());
            }
        };

        let mut session = StompSession::new(
            user.token.as_str(),
            room.id,
            self.options.messages_per_connection,
        );
        let result = run_session(&mut transport, &mut session, &self.options, &ctx.metrics).await;
        if let Err(e) = transport.close(None).await {
            debug!("{}: websocket close failed: {e}", ctx.vu);
        }
        debug!(
            "{}: session finished in state {:?} (sent={}, received={})",
            ctx.vu,
            session.state(),
            session.sent(),
            session.received()
        );
        result
    }
}

/// Drives one session to completion over any frame transport, bounded by
/// the connection-level deadline. A deadline hit forces the session closed
/// and counts as a completed connection, not an error.
pub(crate) async fn run_session<T, E>(
    transport: &mut T,
    session: &mut StompSession,
    options: &WsOptions,
    metrics: &Registry,
) -> anyhow::Result<()>
where
    T: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let phases = session_phases(transport, session, options, metrics);
    match tokio::time::timeout(options.connect_timeout, phases).await {
        Ok(result) => {
            session.close();
            result
        }
        Err(_) => {
            debug!(
                "connection deadline reached in state {:?}, forcing close",
                session.state()
            );
            session.force_close();
            Ok(())
        }
    }
}

async fn session_phases<T, E>(
    transport: &mut T,
    session: &mut StompSession,
    options: &WsOptions,
    metrics: &Registry,
) -> anyhow::Result<()>
where
    T: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    send_frame(transport, session.connect_frame()).await?;

    // Handshake: the CONNECTED frame flips the session to Subscribed and
    // hands back the SUBSCRIBE to send.
    while session.state() == SessionState::Connecting {
        let Some(message) = transport.next().await else {
            anyhow::bail!("connection closed during handshake");
        };
        handle_message(transport, session, metrics, message?).await?;
    }

    // Paced burst. Each pacing window doubles as a read window so echoes
    // arriving mid-burst are still counted.
    while let Some(frame) = session.next_send(epoch_ms()) {
        send_frame(transport, frame).await?;
        metrics.inc_counter("ws_messages_sent");
        read_for(transport, session, metrics, options.message_pacing).await?;
    }

    // Drain: keep counting inbound MESSAGE frames for the grace period.
    read_for(transport, session, metrics, options.drain_wait).await?;
    Ok(())
}

async fn read_for<T, E>(
    transport: &mut T,
    session: &mut StompSession,
    metrics: &Registry,
    window: Duration,
) -> anyhow::Result<()>
where
    T: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let message = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return Ok(()),
            message = transport.next() => message,
        };
        match message {
            Some(message) => handle_message(transport, session, metrics, message?).await?,
            // Peer closed; nothing more will arrive in this window.
            None => return Ok(()),
        }
    }
}

async fn handle_message<T, E>(
    transport: &mut T,
    session: &mut StompSession,
    metrics: &Registry,
    message: Message,
) -> anyhow::Result<()>
where
    T: Sink<Message, Error = E> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let Message::Text(text) = message else {
        return Ok(());
    };
    let frame = match Frame::parse(&text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("discarding unparseable frame: {e}");
            return Ok(());
        }
    };

    let step = session.on_frame(&frame, epoch_ms());
    if step.received_message {
        metrics.inc_counter("ws_messages_received");
    }
    if let Some(latency) = step.latency_ms {
        metrics.record_duration("ws_message_latency", latency);
    }
    if let Some(reply) = step.reply {
        send_frame(transport, reply).await?;
    }
    Ok(())
}

async fn send_frame<T, E>(transport: &mut T, frame: Frame) -> anyhow::Result<()>
where
    T: Sink<Message, Error = E> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    transport.send(Message::Text(frame.encode().into())).await?;
    Ok(())
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::FixtureSet;
    use crate::stomp::Command;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use thiserror::Error;
    use tokio::sync::mpsc;

    #[derive(Debug, Error)]
    #[error("mock transport error")]
    struct MockError;

    /// In-memory stand-in for the websocket stream: frames the driver sends
    /// surface on `from_driver`, frames pushed into `to_driver` are read by
    /// the driver.
    struct MockTransport {
        incoming: mpsc::UnboundedReceiver<Result<Message, MockError>>,
        outgoing: mpsc::UnboundedSender<Message>,
    }

    struct MockPeer {
        to_driver: mpsc::UnboundedSender<Result<Message, MockError>>,
        from_driver: mpsc::UnboundedReceiver<Message>,
    }

    fn mock_pair() -> (MockTransport, MockPeer) {
        let (to_driver, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_driver) = mpsc::unbounded_channel();
        (
            MockTransport { incoming, outgoing },
            MockPeer {
                to_driver,
                from_driver,
            },
        )
    }

    impl Stream for MockTransport {
        type Item = Result<Message, MockError>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.get_mut().incoming.poll_recv(cx)
        }
    }

    impl Sink<Message> for MockTransport {
        type Error = MockError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), MockError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), MockError> {
            self.get_mut().outgoing.send(item).map_err(|_| MockError)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), MockError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), MockError>> {
            Poll::Ready(Ok(()))
        }
    }

    fn text_frame(message: &Message) -> Option<Frame> {
        match message {
            Message::Text(text) => Frame::parse(text).ok(),
            _ => None,
        }
    }

    fn frame_message(frame: Frame) -> Result<Message, MockError> {
        Ok(Message::Text(frame.encode().into()))
    }

    fn options() -> WsOptions {
        WsOptions {
            messages_per_connection: 5,
            message_pacing: Duration::from_millis(500),
            drain_wait: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(15),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_session_paces_burst_and_counts_echoes() {
        let (mut transport, mut peer) = mock_pair();

        // Echo peer: answers CONNECT with CONNECTED and reflects every SEND
        // back as a room-topic MESSAGE, like the service broadcast would.
        let peer_task = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(message) = peer.from_driver.recv().await {
                let Some(frame) = text_frame(&message) else {
                    continue;
                };
                match &frame.command {
                    Command::Connect => {
                        let connected = Frame::new(Command::Connected).with_header("version", "1.2");
                        let _ = peer.to_driver.send(frame_message(connected));
                    }
                    Command::Send => {
                        let echo = Frame::new(Command::Message)
                            .with_header("destination", "/topic/room.3")
                            .with_body(frame.body.clone());
                        let _ = peer.to_driver.send(frame_message(echo));
                    }
                    _ => {}
                }
                seen.push(frame);
            }
            seen
        });

        let metrics = Registry::new();
        let mut session = StompSession::new("tok", 3, 5);
        let started = tokio::time::Instant::now();
        run_session(&mut transport, &mut session, &options(), &metrics)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        // 5 sends paced 500ms apart plus the 2s drain.
        assert!(elapsed >= Duration::from_millis(4500), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(5500), "elapsed {elapsed:?}");
        assert_eq!(session.state(), SessionState::Closed);

        let report = metrics.snapshot();
        assert_eq!(report.counters.get("ws_messages_sent"), Some(&5));
        assert_eq!(report.counters.get("ws_messages_received"), Some(&5));
        assert_eq!(report.trend("ws_message_latency").unwrap().count, 5);

        drop(transport);
        let seen = peer_task.await.unwrap();
        let subscribes: Vec<_> = seen
            .iter()
            .filter(|f| f.command == Command::Subscribe)
            .collect();
        assert_eq!(subscribes.len(), 1);
        assert_eq!(subscribes[0].header("destination"), Some("/topic/room.3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out_without_subscribe_or_send() {
        let (mut transport, mut peer) = mock_pair();

        // Peer consumes frames but never answers; to_driver stays alive so
        // the stream never ends and the deadline has to fire.
        let peer_task = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(message) = peer.from_driver.recv().await {
                if let Some(frame) = text_frame(&message) {
                    seen.push(frame);
                }
            }
            (seen, peer.to_driver)
        });

        let metrics = Registry::new();
        let mut session = StompSession::new("tok", 3, 5);
        let started = tokio::time::Instant::now();
        run_session(&mut transport, &mut session, &options(), &metrics)
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.sent(), 0);

        let report = metrics.snapshot();
        assert!(report.counters.get("ws_messages_sent").is_none());
        assert!(report.counters.get("ws_messages_received").is_none());

        drop(transport);
        let (seen, _to_driver) = peer_task.await.unwrap();
        assert_eq!(seen.len(), 1, "only the CONNECT ever went out");
        assert_eq!(seen[0].command, Command::Connect);
    }

    #[tokio::test]
    async fn test_iteration_no_ops_on_empty_fixture_set() {
        let metrics = Arc::new(Registry::new());
        let scenario = WsScenario::new("ws://127.0.0.1:9", options());
        let ctx = WorkerContext {
            vu: 0,
            fixtures: Arc::new(FixtureSet::default()),
            metrics: metrics.clone(),
        };

        scenario.iteration(&ctx).await.unwrap();
        let report = metrics.snapshot();
        assert!(report.rates.is_empty());
        assert!(report.counters.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_mid_burst_surfaces_as_iteration_error() {
        let (mut transport, mut peer) = mock_pair();

        let peer_task = tokio::spawn(async move {
            while let Some(message) = peer.from_driver.recv().await {
                let Some(frame) = text_frame(&message) else {
                    continue;
                };
                match &frame.command {
                    Command::Connect => {
                        let connected = Frame::new(Command::Connected);
                        let _ = peer.to_driver.send(frame_message(connected));
                    }
                    Command::Send => {
                        // First message in flight breaks the connection.
                        let _ = peer.to_driver.send(Err(MockError));
                    }
                    _ => {}
                }
            }
        });

        let metrics = Registry::new();
        let mut session = StompSession::new("tok", 3, 5);
        let result = run_session(&mut transport, &mut session, &options(), &metrics).await;
        assert!(result.is_err());
        assert_eq!(session.state(), SessionState::Closed);

        drop(transport);
        let _ = peer_task.await;
    }
}
