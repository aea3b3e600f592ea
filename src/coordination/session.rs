//! Per-logged-in-participant session objects and their event sinks.
//!
//! Each session owns an ordered one-way event stream with two observable
//! states: active (a subscriber is consuming) and paused (no live
//! subscriber). Paused events land in a bounded ring buffer that sheds the
//! oldest entry at capacity; that loss is acceptable because clients
//! re-hydrate full state at next login.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{Expiry, HasExpiry, RingBuffer};
use crate::coordination::events::ServerEvent;
use crate::coordination::types::{ParticipantId, SessionId};

/// Events buffered per paused session before the oldest is dropped.
pub const EVENT_BUFFER_CAPACITY: usize = 100;

#[derive(Debug)]
enum SinkState {
    /// A subscriber is attached; deliver immediately in FIFO order.
    Active(mpsc::UnboundedSender<ServerEvent>),
    /// No live subscriber; buffer until one attaches.
    Paused,
}

/// The push side of one session's event stream.
#[derive(Debug)]
pub struct EventSink {
    state: SinkState,
    buffer: RingBuffer<ServerEvent>,
}

impl EventSink {
    fn new() -> Self {
        Self {
            state: SinkState::Paused,
            buffer: RingBuffer::new(EVENT_BUFFER_CAPACITY),
        }
    }

    /// Deliver or buffer an event.
    ///
    /// Returns `false` when the stream is lost: a subscriber was attached but
    /// has gone away, which the caller must treat as session termination.
    fn send(&mut self, event: ServerEvent) -> bool {
        match &self.state {
            SinkState::Active(tx) => tx.send(event).is_ok(),
            SinkState::Paused => {
                self.buffer.push(event);
                true
            }
        }
    }

    /// Attach a subscriber, flushing buffered events ahead of anything newer.
    fn attach(&mut self) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in self.buffer.flush() {
            // The receiver cannot have gone away yet; it is returned below.
            let _sent = tx.send(event);
        }
        self.state = SinkState::Active(tx);
        rx
    }

    fn close(&mut self) {
        self.state = SinkState::Paused;
    }
}

/// A logged-in participant: identity, session token, expiry, and event sink.
#[derive(Debug)]
pub struct ClientSession {
    participant: ParticipantId,
    session_id: SessionId,
    expiry: Expiry,
    sink: EventSink,
    keepalive: Option<JoinHandle<()>>,
}

impl ClientSession {
    pub fn new(participant: ParticipantId, session_id: SessionId, expiry: Expiry) -> Self {
        Self {
            participant,
            session_id,
            expiry,
            sink: EventSink::new(),
            keepalive: None,
        }
    }

    pub fn participant(&self) -> ParticipantId {
        self.participant
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Refresh the session's deadline.
    pub fn extend(&mut self, expiry: Expiry) {
        self.expiry = expiry;
    }

    /// Deliver or buffer an event; `false` means the stream is lost and the
    /// session must be ended.
    pub fn send_event(&mut self, event: ServerEvent) -> bool {
        self.sink.send(event)
    }

    /// Attach (or re-attach) the subscriber side of the event stream,
    /// flushing any buffered events first.
    ///
    /// When `keep_alive` is set, a timer task pushes [`ServerEvent::Keepalive`]
    /// at that interval until the stream closes. Must be called within a
    /// tokio runtime when `keep_alive` is set.
    pub fn attach(
        &mut self,
        keep_alive: Option<Duration>,
    ) -> mpsc::UnboundedReceiver<ServerEvent> {
        self.stop_keepalive();
        let rx = self.sink.attach();
        if let Some(freq) = keep_alive {
            if let SinkState::Active(tx) = &self.sink.state {
                self.keepalive = Some(spawn_keepalive(tx.clone(), freq));
            }
        }
        rx
    }

    /// Close the sink; buffered events are retained for a later attach.
    pub fn close(&mut self) {
        self.stop_keepalive();
        self.sink.close();
    }

    fn stop_keepalive(&mut self) {
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
    }
}

impl HasExpiry for ClientSession {
    fn expiry(&self) -> Expiry {
        self.expiry
    }
}

fn spawn_keepalive(tx: mpsc::UnboundedSender<ServerEvent>, freq: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(freq);
        // The first tick fires immediately; the stream starts with real state.
        interval.tick().await;
        loop {
            interval.tick().await;
            if tx.send(ServerEvent::Keepalive).is_err() {
                break;
            }
        }
    })
}
