#![forbid(unsafe_code)]

// Per-connection STOMP session state machine. The machine is pure: the
// driver feeds it received frames plus the current wall-clock and executes
// whatever frames it hands back, so every transition is testable without a
// socket. Timestamps ride inside the message content so a later MESSAGE
// echo yields a delivery latency sample.

use crate::stomp::frame::{Command, Frame};

/// Connection lifecycle. `Connected` is passed through immediately: receipt
/// of a CONNECTED frame issues the SUBSCRIBE in the same step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Subscribed,
    Sending,
    Draining,
    Closed,
}

/// Outcome of feeding one received frame to the session.
#[derive(Debug, Default)]
pub struct SessionStep {
    /// Frame the driver must send right away (the SUBSCRIBE after CONNECTED).
    pub reply: Option<Frame>,
    /// The frame was an inbound chat MESSAGE.
    pub received_message: bool,
    /// Delivery latency recovered from a timestamp embedded in the body.
    pub latency_ms: Option<u64>,
}

pub struct StompSession {
    state: SessionState,
    token: String,
    room_id: u64,
    messages_total: u32,
    sent: u32,
    received: u32,
}

impl StompSession {
    pub fn new(token: impl Into<String>, room_id: u64, messages_total: u32) -> Self {
        Self {
            state: SessionState::Connecting,
            token: token.into(),
            room_id,
            messages_total,
            sent: 0,
            received: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    /// The opening CONNECT frame. The service authenticates STOMP sessions
    /// through a bearer token smuggled in as a frame header rather than a
    /// STOMP login, so that is what goes on the wire.
    pub fn connect_frame(&self) -> Frame {
        Frame::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("Authorization", format!("Bearer {}", self.token))
    }

    fn subscribe_frame(&self) -> Frame {
        Frame::new(Command::Subscribe)
            .with_header("id", format!("sub-{}", self.room_id))
            .with_header("destination", format!("/topic/room.{}", self.room_id))
    }

    /// Feeds one received frame to the state machine. Unrecognized commands
    /// never change state.
    pub fn on_frame(&mut self, frame: &Frame, now_ms: u64) -> SessionStep {
        let mut step = SessionStep::default();
        if self.state == SessionState::Closed {
            return step;
        }

        match &frame.command {
            Command::Connected if self.state == SessionState::Connecting => {
                // CONNECTED -> SUBSCRIBED in one step; the reply is the
                // SUBSCRIBE for this session's room topic.
                self.state = SessionState::Subscribed;
                step.reply = Some(self.subscribe_frame());
            }
            Command::Message => {
                self.received += 1;
                step.received_message = true;
                step.latency_ms = latency_from_body(&frame.body, now_ms);
            }
            _ => {}
        }
        step
    }

    /// Next SEND frame of the burst, or `None` once the configured count has
    /// gone out (the session then drains). Only yields frames after the
    /// subscription is in place.
    pub fn next_send(&mut self, now_ms: u64) -> Option<Frame> {
        match self.state {
            SessionState::Subscribed | SessionState::Sending => {}
            _ => return None,
        }
        if self.sent >= self.messages_total {
            self.state = SessionState::Draining;
            return None;
        }

        self.state = SessionState::Sending;
        let seq = self.sent;
        self.sent += 1;

        let body = serde_json::json!({
            "roomId": self.room_id,
            "content": format!("load test message {seq} - {now_ms}"),
            "type": "TEXT",
        })
        .to_string();

        Some(
            Frame::new(Command::Send)
                .with_header("destination", "/app/chat.send")
                .with_header("content-type", "application/json")
                .with_body(body),
        )
    }

    /// Normal close at the end of the drain window.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Forced close when the connection-level deadline fires, whatever state
    /// the session is in.
    pub fn force_close(&mut self) {
        self.state = SessionState::Closed;
    }
}

/// Recovers the send timestamp embedded in a chat message body. The service
/// echoes message content verbatim, so the trailing ` - <millis>` marker of
/// our own SEND bodies survives into the broadcast MESSAGE frame.
fn latency_from_body(body: &str, now_ms: u64) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let content = value.get("content")?.as_str()?;
    let (_, timestamp) = content.rsplit_once(" - ")?;
    let sent_ms: u64 = timestamp.trim().parse().ok()?;
    Some(now_ms.saturating_sub(sent_ms))
}
