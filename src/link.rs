//! Connection state machine for the transport bridge.
//!
//! Pure transitions, no I/O: the bridge feeds in observed socket events and
//! performs whatever actions get queued. Reconnect policy lives entirely
//! here so it can be exercised without a network.

use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay before the single reconnect attempt after an abnormal closure.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
    ClosedNormal,
    ClosedAbnormal,
}

/// Socket events observed by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A dial attempt has started.
    DialStarted,
    /// The socket handshake completed.
    Opened,
    /// The dial attempt failed before the socket opened.
    ConnectFailed,
    /// The peer closed with a clean close frame.
    ClosedNormal,
    /// The connection dropped without a clean close.
    ClosedAbnormal,
    /// The armed retry timer fired.
    RetryElapsed,
}

/// Actions for the bridge to perform, drained after each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    /// Send the one-time setup handshake, before any data message.
    SendSetup,
    /// Arm the one-shot reconnect timer.
    ScheduleRetry(Duration),
    /// Start a new dial attempt.
    Dial,
}

/// Typed transition machine over [`LinkState`].
pub struct LinkStateMachine {
    state: LinkState,
    retry_delay: Duration,
    /// A retry is armed and has not fired yet. Guards against a second
    /// abnormal-closure observation arming a duplicate timer.
    retry_pending: bool,
    actions: Vec<LinkAction>,
}

impl LinkStateMachine {
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            retry_delay: RETRY_DELAY,
            retry_pending: false,
            actions: Vec::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Data messages may only be sent while the link is open and the setup
    /// handshake has gone out.
    pub fn can_send(&self) -> bool {
        self.state == LinkState::Open
    }

    /// Process one observed event.
    pub fn on_event(&mut self, event: LinkEvent) {
        match (self.state, event) {
            (LinkState::Disconnected, LinkEvent::DialStarted)
            | (LinkState::ClosedAbnormal, LinkEvent::DialStarted) => {
                self.state = LinkState::Connecting;
            }

            (LinkState::Connecting, LinkEvent::Opened) => {
                info!("Link open, queueing setup handshake");
                self.state = LinkState::Open;
                self.actions.push(LinkAction::SendSetup);
            }

            (LinkState::Connecting, LinkEvent::ConnectFailed) => {
                warn!("Dial failed, link stays down");
                self.state = LinkState::Disconnected;
            }

            (LinkState::Open, LinkEvent::ClosedNormal) => {
                info!("Link closed normally");
                self.state = LinkState::ClosedNormal;
            }

            (LinkState::Open, LinkEvent::ClosedAbnormal) => {
                warn!("Link dropped, retrying in {:?}", self.retry_delay);
                self.state = LinkState::ClosedAbnormal;
                self.retry_pending = true;
                self.actions.push(LinkAction::ScheduleRetry(self.retry_delay));
            }

            (LinkState::ClosedAbnormal, LinkEvent::ClosedAbnormal) => {
                // Retry already armed; a duplicate observation must not arm another.
                debug!("Duplicate abnormal-closure event ignored");
            }

            (LinkState::ClosedAbnormal, LinkEvent::RetryElapsed) if self.retry_pending => {
                info!("Retry delay elapsed, dialing again");
                self.retry_pending = false;
                self.actions.push(LinkAction::Dial);
            }

            (state, event) => {
                debug!("Ignoring {:?} in state {:?}", event, state);
            }
        }
    }

    /// Drain all pending actions.
    pub fn drain_actions(&mut self) -> Vec<LinkAction> {
        std::mem::take(&mut self.actions)
    }
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
