//! WebRTC call signaling over chat messages.
//!
//! Calls are negotiated with `ninchat.com/rtc/*` messages in the active
//! channel. This module tracks one exchange at a time and decides which
//! messages to send, when to request ICE servers and what to tell the media
//! engine. It never touches SDP or candidates itself; those are opaque
//! dictionaries passed between the peer and the engine.
//!
//! # Flows
//!
//! Callee: `call` received (Ringing) → local pick-up → `offer` received →
//! ICE servers requested → engine started with the offer (Active).
//!
//! Caller: local dial (Dialing) → `pick-up` received → ICE servers requested
//! → engine started (Active) → `answer` received.
//!
//! Remote candidates arriving before the engine reports readiness are held in
//! the exchange and flushed in arrival order once it does.

use parlor_proto::{
    ActionId, MessageType,
    payloads::{IceServers, RtcSignal},
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{action::SessionNotification, chat::ChannelUser, error::SessionError};

/// Call state reported to the application.
///
/// `Ended` is reported once when an exchange is torn down; the machine is
/// then back at `NoCall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No exchange.
    NoCall,
    /// Incoming call not yet connected.
    Ringing,
    /// Outgoing call not yet connected.
    Dialing,
    /// Media engine running.
    Active,
    /// Exchange torn down.
    Ended,
}

/// Which side of the negotiation this client is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    /// Sent the invite, creates the offer.
    Caller,
    /// Received the invite, answers the offer.
    Callee,
}

/// Commands for the media engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcCommand {
    /// Create the peer connection.
    StartPeerConnection {
        /// Negotiation side.
        mode: OperatingMode,
        /// STUN/TURN servers.
        ice_servers: IceServers,
    },
    /// Apply the peer's session description.
    SetRemoteDescription {
        /// `RtcOffer` or `RtcAnswer`.
        kind: MessageType,
        /// Opaque SDP dictionary.
        sdp: Map<String, Value>,
    },
    /// Add a remote ICE candidate.
    AddIceCandidate {
        /// Opaque candidate dictionary.
        candidate: Map<String, Value>,
    },
    /// Tear down the peer connection.
    ClosePeerConnection,
}

/// Work the session performs on behalf of the signaling machine.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SignalStep {
    Send { kind: MessageType, signal: RtcSignal },
    BeginIce,
    Rtc(RtcCommand),
    Notify(SessionNotification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Invite received, waiting for the local user.
    Ringing,
    /// Picked up, waiting for the caller's offer.
    Accepted,
    /// Invite sent, waiting for the peer's pick-up.
    Dialing,
    /// `begin_ice` in flight.
    AwaitingIce,
    /// Engine started.
    Active,
}

#[derive(Debug)]
struct SignalingExchange {
    mode: OperatingMode,
    peer: Option<ChannelUser>,
    phase: Phase,
    ice_request: Option<ActionId>,
    remote_offer: Option<Map<String, Value>>,
    pending_candidates: Vec<Map<String, Value>>,
    peer_ready: bool,
}

impl SignalingExchange {
    fn call_state(&self) -> CallState {
        match (self.phase, self.mode) {
            (Phase::Active, _) => CallState::Active,
            (_, OperatingMode::Callee) => CallState::Ringing,
            (_, OperatingMode::Caller) => CallState::Dialing,
        }
    }

    fn started(&self) -> bool {
        self.phase == Phase::Active
    }
}

/// Signaling state machine for the active channel.
#[derive(Debug, Default)]
pub struct Signaling {
    exchange: Option<SignalingExchange>,
}

impl Signaling {
    /// Idle machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current call state.
    pub fn state(&self) -> CallState {
        self.exchange.as_ref().map_or(CallState::NoCall, SignalingExchange::call_state)
    }

    /// Remote party, once known.
    pub fn peer(&self) -> Option<&ChannelUser> {
        self.exchange.as_ref().and_then(|e| e.peer.as_ref())
    }

    /// Mode of the current exchange.
    pub fn mode(&self) -> Option<OperatingMode> {
        self.exchange.as_ref().map(|e| e.mode)
    }

    /// Remote candidates held until the engine is ready.
    pub fn pending_candidates(&self) -> usize {
        self.exchange.as_ref().map_or(0, |e| e.pending_candidates.len())
    }

    pub(crate) fn dial(&mut self) -> Result<Vec<SignalStep>, SessionError> {
        if self.exchange.is_some() {
            return Err(self.invalid("dial"));
        }
        info!("dialing");
        self.exchange = Some(SignalingExchange {
            mode: OperatingMode::Caller,
            peer: None,
            phase: Phase::Dialing,
            ice_request: None,
            remote_offer: None,
            pending_candidates: Vec::new(),
            peer_ready: false,
        });
        Ok(vec![
            SignalStep::Send { kind: MessageType::RtcCall, signal: RtcSignal::default() },
            state_changed(CallState::Dialing),
        ])
    }

    pub(crate) fn pick_up(&mut self, answer: bool) -> Result<Vec<SignalStep>, SessionError> {
        let Some(exchange) = self.exchange.as_mut().filter(|e| e.phase == Phase::Ringing) else {
            return Err(self.invalid("pick up"));
        };
        let mut steps =
            vec![SignalStep::Send { kind: MessageType::RtcPickUp, signal: RtcSignal::pick_up(answer) }];
        if answer {
            info!("call accepted");
            exchange.phase = Phase::Accepted;
        } else {
            steps.extend(self.teardown("call declined"));
        }
        Ok(steps)
    }

    pub(crate) fn hang_up(&mut self) -> Result<Vec<SignalStep>, SessionError> {
        if self.exchange.is_none() {
            return Err(self.invalid("hang up"));
        }
        let mut steps = vec![SignalStep::Send { kind: MessageType::RtcHangUp, signal: RtcSignal::default() }];
        steps.extend(self.teardown("hung up"));
        Ok(steps)
    }

    pub(crate) fn local_description(
        &mut self,
        kind: MessageType,
        sdp: Map<String, Value>,
    ) -> Result<Vec<SignalStep>, SessionError> {
        if !matches!(kind, MessageType::RtcOffer | MessageType::RtcAnswer) {
            return Err(self.invalid("send a description of this type"));
        }
        if !self.exchange.as_ref().is_some_and(SignalingExchange::started) {
            return Err(self.invalid("send a session description"));
        }
        Ok(vec![SignalStep::Send { kind, signal: RtcSignal::description(sdp) }])
    }

    pub(crate) fn local_candidate(&mut self, candidate: Map<String, Value>) -> Result<Vec<SignalStep>, SessionError> {
        if !self.exchange.as_ref().is_some_and(SignalingExchange::started) {
            return Err(self.invalid("send an ICE candidate"));
        }
        Ok(vec![SignalStep::Send { kind: MessageType::RtcIceCandidate, signal: RtcSignal::candidate(candidate) }])
    }

    /// Interpret a signal received from `sender`.
    pub(crate) fn on_signal(&mut self, kind: MessageType, sender: ChannelUser, signal: RtcSignal) -> Vec<SignalStep> {
        if let Some(peer) = self.peer()
            && peer.user_id != sender.user_id
        {
            warn!(%kind, sender = %sender.user_id, "signal from user outside the call, ignoring");
            return Vec::new();
        }

        match kind {
            MessageType::RtcCall => self.on_call(sender, signal),
            MessageType::RtcPickUp => self.on_pick_up(sender, signal),
            MessageType::RtcOffer => self.on_offer(signal),
            MessageType::RtcAnswer => self.on_answer(signal),
            MessageType::RtcIceCandidate => self.on_candidate(signal),
            MessageType::RtcHangUp => self.on_hang_up(sender, signal),
            _ => Vec::new(),
        }
    }

    fn on_call(&mut self, sender: ChannelUser, signal: RtcSignal) -> Vec<SignalStep> {
        if self.exchange.is_some() {
            warn!(caller = %sender.user_id, "already in a call, ignoring invite");
            return Vec::new();
        }
        info!(caller = %sender.user_id, "incoming call");
        self.exchange = Some(SignalingExchange {
            mode: OperatingMode::Callee,
            peer: Some(sender.clone()),
            phase: Phase::Ringing,
            ice_request: None,
            remote_offer: None,
            pending_candidates: Vec::new(),
            peer_ready: false,
        });
        vec![notify_signal(MessageType::RtcCall, sender, signal), state_changed(CallState::Ringing)]
    }

    fn on_pick_up(&mut self, sender: ChannelUser, signal: RtcSignal) -> Vec<SignalStep> {
        let Some(exchange) = self.exchange.as_mut().filter(|e| e.phase == Phase::Dialing) else {
            warn!("pick-up without an outgoing call, ignoring");
            return Vec::new();
        };
        exchange.peer = Some(sender.clone());
        let accepted = signal.answer.unwrap_or(false);
        let mut steps = vec![notify_signal(MessageType::RtcPickUp, sender, signal)];
        if accepted {
            exchange.phase = Phase::AwaitingIce;
            steps.push(SignalStep::BeginIce);
        } else {
            steps.extend(self.teardown("call rejected"));
        }
        steps
    }

    fn on_offer(&mut self, signal: RtcSignal) -> Vec<SignalStep> {
        let Some(sdp) = signal.sdp else {
            warn!("offer without a session description, ignoring");
            return Vec::new();
        };
        let state = self.state();
        match self.exchange.as_mut() {
            Some(exchange) if exchange.mode == OperatingMode::Callee && exchange.phase == Phase::Accepted => {
                exchange.remote_offer = Some(sdp);
                exchange.phase = Phase::AwaitingIce;
                vec![SignalStep::BeginIce]
            },
            Some(exchange) if exchange.started() => {
                debug!("renegotiation offer");
                vec![SignalStep::Rtc(RtcCommand::SetRemoteDescription { kind: MessageType::RtcOffer, sdp })]
            },
            _ => {
                warn!(?state, "unexpected offer, ignoring");
                Vec::new()
            },
        }
    }

    fn on_answer(&mut self, signal: RtcSignal) -> Vec<SignalStep> {
        match (self.exchange.as_ref(), signal.sdp) {
            (Some(exchange), Some(sdp)) if exchange.started() => {
                vec![SignalStep::Rtc(RtcCommand::SetRemoteDescription { kind: MessageType::RtcAnswer, sdp })]
            },
            _ => {
                warn!(state = ?self.state(), "unexpected answer, ignoring");
                Vec::new()
            },
        }
    }

    fn on_candidate(&mut self, signal: RtcSignal) -> Vec<SignalStep> {
        let (Some(exchange), Some(candidate)) = (self.exchange.as_mut(), signal.candidate) else {
            debug!("candidate outside a call, dropping");
            return Vec::new();
        };
        if exchange.peer_ready {
            vec![SignalStep::Rtc(RtcCommand::AddIceCandidate { candidate })]
        } else {
            exchange.pending_candidates.push(candidate);
            Vec::new()
        }
    }

    fn on_hang_up(&mut self, sender: ChannelUser, signal: RtcSignal) -> Vec<SignalStep> {
        if self.exchange.is_none() {
            return Vec::new();
        }
        let mut steps = vec![notify_signal(MessageType::RtcHangUp, sender, signal)];
        steps.extend(self.teardown("peer hung up"));
        steps
    }

    /// Record the `begin_ice` request issued for the exchange.
    pub(crate) fn ice_requested(&mut self, request: ActionId) {
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.ice_request = Some(request);
        }
    }

    /// Whether `request` is the exchange's ICE request.
    pub(crate) fn owns_ice_request(&self, request: ActionId) -> bool {
        self.exchange.as_ref().is_some_and(|e| e.ice_request == Some(request))
    }

    pub(crate) fn on_ice_servers(&mut self, request: ActionId, ice_servers: IceServers) -> Vec<SignalStep> {
        let Some(exchange) = self
            .exchange
            .as_mut()
            .filter(|e| e.ice_request == Some(request) && e.phase == Phase::AwaitingIce)
        else {
            return Vec::new();
        };
        exchange.ice_request = None;
        exchange.phase = Phase::Active;
        info!(mode = ?exchange.mode, "starting peer connection");

        let mut steps = vec![SignalStep::Rtc(RtcCommand::StartPeerConnection { mode: exchange.mode, ice_servers })];
        if let Some(sdp) = exchange.remote_offer.take() {
            steps.push(SignalStep::Rtc(RtcCommand::SetRemoteDescription { kind: MessageType::RtcOffer, sdp }));
        }
        steps.push(state_changed(CallState::Active));
        steps
    }

    /// ICE server request failed: abort the exchange and tell the peer.
    pub(crate) fn on_ice_failed(&mut self, request: ActionId, reason: &str) -> Vec<SignalStep> {
        if !self.owns_ice_request(request) {
            return Vec::new();
        }
        warn!(reason, "ICE server request failed, aborting call");
        let mut steps = vec![SignalStep::Send { kind: MessageType::RtcHangUp, signal: RtcSignal::default() }];
        steps.extend(self.teardown(reason));
        steps
    }

    pub(crate) fn on_peer_ready(&mut self) -> Vec<SignalStep> {
        let Some(exchange) = self.exchange.as_mut() else {
            return Vec::new();
        };
        exchange.peer_ready = true;
        debug!(count = exchange.pending_candidates.len(), "flushing held candidates");
        exchange
            .pending_candidates
            .drain(..)
            .map(|candidate| SignalStep::Rtc(RtcCommand::AddIceCandidate { candidate }))
            .collect()
    }

    pub(crate) fn on_peer_failed(&mut self, reason: &str) -> Vec<SignalStep> {
        if self.exchange.is_none() {
            return Vec::new();
        }
        let mut steps = vec![SignalStep::Send { kind: MessageType::RtcHangUp, signal: RtcSignal::default() }];
        steps.extend(self.teardown(reason));
        steps
    }

    /// Drop any exchange without messaging the peer (channel or session gone).
    pub(crate) fn reset(&mut self, reason: &str) -> Vec<SignalStep> {
        if self.exchange.is_none() {
            return Vec::new();
        }
        self.teardown(reason)
    }

    fn teardown(&mut self, reason: &str) -> Vec<SignalStep> {
        let Some(exchange) = self.exchange.take() else {
            return Vec::new();
        };
        info!(reason, "call ended");
        let mut steps = Vec::new();
        if exchange.started() {
            steps.push(SignalStep::Rtc(RtcCommand::ClosePeerConnection));
        }
        steps.push(state_changed(CallState::Ended));
        steps
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidCallState { state: self.state(), operation }
    }
}

fn notify_signal(kind: MessageType, sender: ChannelUser, signal: RtcSignal) -> SignalStep {
    SignalStep::Notify(SessionNotification::RtcSignal { kind, sender, signal })
}

fn state_changed(state: CallState) -> SignalStep {
    SignalStep::Notify(SessionNotification::CallStateChanged { state })
}
