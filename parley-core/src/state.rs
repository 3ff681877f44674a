//! Connection state machine for Parley.
//!
//! This module provides a pure, side-effect-free state machine for managing
//! connection lifecycle. The state machine takes events as input and produces
//! a new state plus a list of actions to execute.
//!
//! The actual I/O (opening sockets, arming timers) is performed by
//! parley-client, not by this module. This enables instant unit testing
//! without network mocks.

use std::time::Duration;

use parley_types::ConversationId;

/// Interval between client heartbeat pings while connected.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// A connection with no inbound traffic for this long is considered dead.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// First reconnect delay after a connected session is lost.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound for the reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Lifecycle state of the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to connect.
    Disconnected,
    /// Transport open and handshake in progress.
    Connecting,
    /// Handshake complete, namespace joined.
    Connected,
    /// Connection lost, waiting for the reconnect timer.
    Reconnecting {
        /// Number of consecutive failed attempts so far.
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if currently trying to connect.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }
}

/// Deterministic exponential backoff: 1s, 2s, 4s ... capped at 30s.
///
/// Only a successful connection resets the schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    next: Duration,
    /// One-shot delay announced by the server, consumed by the next schedule.
    announced: Option<Duration>,
}

impl Backoff {
    /// Start a fresh schedule.
    pub fn new() -> Self {
        Self {
            next: INITIAL_BACKOFF,
            announced: None,
        }
    }

    /// Return the delay for the next attempt and advance the schedule.
    ///
    /// A server-announced delay is used exactly once and does not advance
    /// the exponential schedule.
    pub fn next_delay(&mut self) -> Duration {
        if let Some(delay) = self.announced.take() {
            return delay;
        }
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        delay
    }

    /// Use `delay` for the next attempt instead of the computed value.
    pub fn announce(&mut self, delay: Duration) {
        self.announced = Some(delay);
    }

    /// Reset to the initial delay.
    pub fn reset(&mut self) {
        self.next = INITIAL_BACKOFF;
        self.announced = None;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMachine {
    state: ConnectionState,
    backoff: Backoff,
    /// Consecutive failed attempts since the last successful connection.
    failures: u32,
    active_room: Option<ConversationId>,
}

impl ConnectionMachine {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(),
            failures: 0,
            active_room: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Conversation room re-joined after every reconnect.
    pub fn active_room(&self) -> Option<ConversationId> {
        self.active_room
    }

    /// Process an event and return the new machine plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (parley-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(mut self, event: Event) -> (Self, Vec<Action>) {
        use ConnectionState as S;

        let actions = match (self.state, event) {
            // Room bookkeeping is valid in every state.
            (_, Event::RoomJoined { conversation }) => {
                self.active_room = Some(conversation);
                vec![]
            }

            // From Disconnected
            (S::Disconnected, Event::ConnectRequested) => {
                self.state = S::Connecting;
                vec![Action::OpenTransport]
            }

            // From Connecting
            (S::Connecting, Event::TransportConnected) => {
                self.state = S::Connected;
                self.backoff.reset();
                self.failures = 0;
                let mut actions = vec![Action::StartHeartbeat];
                if let Some(conversation) = self.active_room {
                    actions.push(Action::JoinRoom { conversation });
                }
                actions.push(Action::Resync);
                actions.push(Action::DrainOutbox);
                actions.push(Action::Emit(LifecycleEvent::Connected));
                actions
            }
            (S::Connecting, Event::TransportFailed { error })
            | (S::Connecting, Event::ConnectionLost { reason: error }) => {
                self.schedule_retry(LifecycleEvent::ConnectionFailed { error })
            }

            // From Connected
            (S::Connected, Event::ConnectionLost { reason }) => {
                let mut actions = vec![Action::StopHeartbeat, Action::CloseTransport];
                actions.extend(self.schedule_retry(LifecycleEvent::Disconnected { reason }));
                actions
            }
            (S::Connected, Event::HeartbeatTimeout) => {
                let mut actions = vec![Action::StopHeartbeat, Action::CloseTransport];
                actions.extend(self.schedule_retry(
                    LifecycleEvent::Disconnected {
                        reason: "heartbeat timeout".into(),
                    },
                ));
                actions
            }
            (S::Connected, Event::ServerShutdown { reconnect_delay }) => {
                self.backoff.announce(reconnect_delay);
                let mut actions = vec![Action::StopHeartbeat, Action::CloseTransport];
                actions.extend(self.schedule_retry(
                    LifecycleEvent::Disconnected {
                        reason: "server shutdown".into(),
                    },
                ));
                actions
            }

            // From Reconnecting
            (S::Reconnecting { .. }, Event::ReconnectTimer) => {
                self.state = S::Connecting;
                vec![Action::OpenTransport]
            }

            // Auth rejection is terminal: no retry.
            (S::Connecting | S::Connected, Event::AuthRejected { reason }) => {
                let was_connected = self.state.is_connected();
                self.state = S::Disconnected;
                self.backoff.reset();
                self.failures = 0;
                let mut actions = Vec::new();
                if was_connected {
                    actions.push(Action::StopHeartbeat);
                }
                actions.push(Action::CloseTransport);
                actions.push(Action::Emit(LifecycleEvent::AuthRejected { reason }));
                actions
            }

            // Explicit disconnect/pause wins from any live state.
            (state, Event::DisconnectRequested) | (state, Event::PauseRequested)
                if state != S::Disconnected =>
            {
                self.state = S::Disconnected;
                self.backoff.reset();
                self.failures = 0;
                let mut actions = Vec::new();
                match state {
                    S::Connected => {
                        actions.push(Action::StopHeartbeat);
                        actions.push(Action::CloseTransport);
                    }
                    S::Connecting => actions.push(Action::CloseTransport),
                    S::Reconnecting { .. } => actions.push(Action::CancelReconnectTimer),
                    S::Disconnected => {}
                }
                actions.push(Action::Emit(LifecycleEvent::Disconnected {
                    reason: "requested".into(),
                }));
                actions
            }

            // Invalid transitions - stay in current state
            _ => vec![],
        };

        (self, actions)
    }

    /// In-place variant of [`on_event`](Self::on_event).
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let machine = std::mem::take(self);
        let (next, actions) = machine.on_event(event);
        *self = next;
        actions
    }

    fn schedule_retry(&mut self, notice: LifecycleEvent) -> Vec<Action> {
        self.failures = self.failures.saturating_add(1);
        let attempt = self.failures;
        let delay = self.backoff.next_delay();
        self.state = ConnectionState::Reconnecting { attempt };
        vec![
            Action::Emit(notice),
            Action::Emit(LifecycleEvent::Reconnecting { attempt, delay }),
            Action::StartReconnectTimer { delay },
        ]
    }
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Events that can occur in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Application requested a connection (`connect()` or `resume()`).
    ConnectRequested,
    /// Transport opened and the namespace CONNECT was confirmed.
    TransportConnected,
    /// Transport could not be opened or the handshake failed.
    TransportFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Transport closed unexpectedly.
    ConnectionLost {
        /// Reason for disconnection.
        reason: String,
    },
    /// No inbound traffic within [`IDLE_TIMEOUT`].
    HeartbeatTimeout,
    /// Reconnect timer fired.
    ReconnectTimer,
    /// Application requested disconnect.
    DisconnectRequested,
    /// Application moved to the background.
    PauseRequested,
    /// Server announced a cooperative shutdown.
    ServerShutdown {
        /// Exact delay before the next attempt.
        reconnect_delay: Duration,
    },
    /// Server refused the credentials (CONNECT_ERROR).
    AuthRejected {
        /// Server-provided reason.
        reason: String,
    },
    /// Connection is now in a conversation room.
    RoomJoined {
        /// The conversation joined.
        conversation: ConversationId,
    },
}

/// Actions to be executed by the client.
///
/// These are instructions, not side effects. The client interprets these
/// and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the transport and run the handshake.
    OpenTransport,
    /// Close the transport.
    CloseTransport,
    /// Start a timer for reconnection.
    StartReconnectTimer {
        /// Delay before attempting reconnection.
        delay: Duration,
    },
    /// Cancel any pending reconnect timer.
    CancelReconnectTimer,
    /// Start the heartbeat ping and idle watchdog.
    StartHeartbeat,
    /// Stop the heartbeat.
    StopHeartbeat,
    /// Re-join the previously active conversation room.
    JoinRoom {
        /// Conversation to re-join.
        conversation: ConversationId,
    },
    /// Fetch messages after the stored cursor of every tracked conversation.
    Resync,
    /// Send queued outbox entries.
    DrainOutbox,
    /// Emit an event to the application.
    Emit(LifecycleEvent),
}

/// Lifecycle notifications emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Successfully connected.
    Connected,
    /// Connection attempt failed.
    ConnectionFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Disconnected from the server.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// Reconnect scheduled.
    Reconnecting {
        /// Which reconnection attempt this will be.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Credentials rejected; the client will not retry.
    AuthRejected {
        /// Server-provided reason.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> ConnectionMachine {
        let (machine, _) = ConnectionMachine::new().on_event(Event::ConnectRequested);
        let (machine, _) = machine.on_event(Event::TransportConnected);
        machine
    }

    fn scheduled_delay(actions: &[Action]) -> Option<Duration> {
        actions.iter().find_map(|a| match a {
            Action::StartReconnectTimer { delay } => Some(*delay),
            _ => None,
        })
    }

    #[test]
    fn starts_disconnected() {
        let machine = ConnectionMachine::new();
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connect_request_transitions_to_connecting() {
        let (machine, actions) = ConnectionMachine::new().on_event(Event::ConnectRequested);

        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(actions, vec![Action::OpenTransport]);
    }

    #[test]
    fn transport_connected_starts_heartbeat_and_resyncs() {
        let (machine, _) = ConnectionMachine::new().on_event(Event::ConnectRequested);
        let (machine, actions) = machine.on_event(Event::TransportConnected);

        assert!(machine.state().is_connected());
        assert!(actions.contains(&Action::StartHeartbeat));
        assert!(actions.contains(&Action::Resync));
        assert!(actions.contains(&Action::DrainOutbox));
        assert!(actions.contains(&Action::Emit(LifecycleEvent::Connected)));
        // No room known yet.
        assert!(!actions.iter().any(|a| matches!(a, Action::JoinRoom { .. })));
    }

    #[test]
    fn reconnect_rejoins_last_active_room() {
        let conversation = ConversationId::new();
        let mut machine = connected();
        machine.handle(Event::RoomJoined { conversation });

        machine.handle(Event::ConnectionLost {
            reason: "reset".into(),
        });
        machine.handle(Event::ReconnectTimer);
        let actions = machine.handle(Event::TransportConnected);

        let join = actions
            .iter()
            .position(|a| *a == Action::JoinRoom { conversation })
            .expect("room re-joined");
        let resync = actions.iter().position(|a| *a == Action::Resync).unwrap();
        assert!(join < resync);
    }

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        let mut machine = ConnectionMachine::new();
        machine.handle(Event::ConnectRequested);

        let mut delays = Vec::new();
        for _ in 0..7 {
            let actions = machine.handle(Event::TransportFailed {
                error: "refused".into(),
            });
            delays.push(scheduled_delay(&actions).unwrap().as_secs());
            machine.handle(Event::ReconnectTimer);
        }

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn backoff_resets_only_after_connected() {
        let mut machine = ConnectionMachine::new();
        machine.handle(Event::ConnectRequested);
        for _ in 0..3 {
            machine.handle(Event::TransportFailed {
                error: "refused".into(),
            });
            machine.handle(Event::ReconnectTimer);
        }
        machine.handle(Event::TransportConnected);

        let actions = machine.handle(Event::ConnectionLost {
            reason: "reset".into(),
        });
        assert_eq!(scheduled_delay(&actions), Some(Duration::from_secs(1)));
        assert_eq!(machine.state(), ConnectionState::Reconnecting { attempt: 1 });
    }

    #[test]
    fn attempt_counter_increments() {
        let mut machine = connected();
        machine.handle(Event::ConnectionLost {
            reason: "reset".into(),
        });
        machine.handle(Event::ReconnectTimer);
        machine.handle(Event::TransportFailed {
            error: "refused".into(),
        });

        assert_eq!(machine.state(), ConnectionState::Reconnecting { attempt: 2 });
    }

    #[test]
    fn server_shutdown_delay_used_exactly_once() {
        let mut machine = connected();
        let actions = machine.handle(Event::ServerShutdown {
            reconnect_delay: Duration::from_millis(2500),
        });
        assert!(actions.contains(&Action::CloseTransport));
        assert_eq!(scheduled_delay(&actions), Some(Duration::from_millis(2500)));

        // That attempt fails: normal backoff resumes.
        machine.handle(Event::ReconnectTimer);
        let actions = machine.handle(Event::TransportFailed {
            error: "still down".into(),
        });
        assert_eq!(scheduled_delay(&actions), Some(Duration::from_secs(1)));
    }

    #[test]
    fn heartbeat_timeout_reconnects() {
        let mut machine = connected();
        let actions = machine.handle(Event::HeartbeatTimeout);

        assert!(matches!(
            machine.state(),
            ConnectionState::Reconnecting { .. }
        ));
        assert!(actions.contains(&Action::StopHeartbeat));
        assert!(actions.contains(&Action::CloseTransport));
    }

    #[test]
    fn disconnect_from_reconnecting_cancels_timer() {
        let mut machine = connected();
        machine.handle(Event::ConnectionLost {
            reason: "reset".into(),
        });
        let actions = machine.handle(Event::DisconnectRequested);

        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(actions.contains(&Action::CancelReconnectTimer));
    }

    #[test]
    fn pause_from_connected_closes_everything() {
        let mut machine = connected();
        let actions = machine.handle(Event::PauseRequested);

        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(actions.contains(&Action::StopHeartbeat));
        assert!(actions.contains(&Action::CloseTransport));

        // Timer firing after pause is ignored.
        let actions = machine.handle(Event::ReconnectTimer);
        assert!(actions.is_empty());
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn resume_after_pause_connects() {
        let mut machine = connected();
        machine.handle(Event::PauseRequested);
        let actions = machine.handle(Event::ConnectRequested);

        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(actions, vec![Action::OpenTransport]);
    }

    #[test]
    fn auth_rejection_is_terminal() {
        let mut machine = ConnectionMachine::new();
        machine.handle(Event::ConnectRequested);
        let actions = machine.handle(Event::AuthRejected {
            reason: "bad token".into(),
        });

        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(scheduled_delay(&actions).is_none());
        assert!(actions.contains(&Action::Emit(LifecycleEvent::AuthRejected {
            reason: "bad token".into()
        })));
    }

    #[test]
    fn disconnect_when_disconnected_is_noop() {
        let (machine, actions) = ConnectionMachine::new().on_event(Event::DisconnectRequested);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(actions.is_empty());
    }

    #[test]
    fn stray_transport_events_are_ignored() {
        let (machine, actions) = ConnectionMachine::new().on_event(Event::TransportConnected);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(actions.is_empty());
    }

    #[test]
    fn is_connecting_helper() {
        assert!(!ConnectionState::Disconnected.is_connecting());
        assert!(ConnectionState::Connecting.is_connecting());
        assert!(!ConnectionState::Connected.is_connecting());
        assert!(ConnectionState::Reconnecting { attempt: 1 }.is_connecting());
    }
}
