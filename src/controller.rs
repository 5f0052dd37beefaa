//! Session controller
//!
//! Owns every resource of the live interview and drives them from the
//! reducer's effects. One tokio task runs the loop; commands arrive through a
//! [`ControllerHandle`] and status updates leave through a watch channel and
//! any number of subscribers.
//!
//! ```text
//! ControllerHandle ──Start/Stop/Exit──▶ ┌──────────────┐ ◀── setup outcomes (spawned task)
//!                                       │  event loop  │ ◀── TransportEvent (active session)
//! StatusUpdate ◀── watch / subscribers ─┤ reduce()     │ ◀── finished SourceIds (speaker)
//!                                       └──────────────┘
//! ```
//!
//! Resources of a session that is still connecting live in the setup task;
//! once it reports back they move into a `LiveSession` owned by the loop.
//! Dropping any of them releases the underlying device or connection, so a
//! result that arrives after `stop()` is simply dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{
    CaptureConfig, CaptureError, CapturePipeline, Microphone, MicrophoneStream, PlaybackError,
    PlaybackScheduler, SourceId, Speaker, PLAYBACK_SAMPLE_RATE,
};
use crate::live::{LiveConfig, LiveError, Transport, TransportEvent, TransportHandle};
use crate::state_machine::{reduce, Effect, Event, FailureReason, SessionState, State};

/// Status snapshot published on every transition.
/// Serializes as `{ "status": "active", "message": "Interviewing Live" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: SessionState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StatusUpdate {
    pub fn from_state(state: &State) -> Self {
        let status = state.session_state();
        let (reason, detail) = match state {
            State::Error { reason, message } => (Some(*reason), Some(message.clone())),
            _ => (None, None),
        };

        let message = match (status, reason) {
            (SessionState::Idle, _) => "Ready to chat",
            (SessionState::Connecting, _) => "Connecting...",
            (SessionState::Active, _) => "Interviewing Live",
            (SessionState::Ended, _) => "Session Ended",
            (SessionState::Error, Some(FailureReason::PermissionDenied)) => {
                "Microphone access required"
            }
            (SessionState::Error, Some(FailureReason::OutputUnavailable)) => {
                "Audio output unavailable"
            }
            (SessionState::Error, _) => "Connection Error",
        };

        Self {
            status,
            message: message.to_string(),
            reason,
            detail,
        }
    }
}

/// Errors returned by [`ControllerHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// The event loop has exited
    Stopped,
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::Stopped => write!(f, "Session controller is not running"),
        }
    }
}

impl std::error::Error for ControllerError {}

/// External collaborators the controller drives
#[derive(Clone)]
pub struct Devices {
    pub microphone: Arc<dyn Microphone>,
    pub speaker: Arc<dyn Speaker>,
    pub transport: Arc<dyn Transport>,
}

/// Per-session parameters
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub live: LiveConfig,
    pub capture: CaptureConfig,
    pub playback_sample_rate: u32,
    pub playback_channels: usize,
}

impl SessionOptions {
    pub fn for_topic(topic: &str) -> Self {
        Self {
            live: LiveConfig::for_topic(topic),
            ..Self::default()
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            live: LiveConfig::default(),
            capture: CaptureConfig::default(),
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            playback_channels: 1,
        }
    }
}

/// Cloneable command side of the controller
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Event>,
    status: watch::Receiver<StatusUpdate>,
}

impl ControllerHandle {
    pub async fn start(&self) -> Result<(), ControllerError> {
        self.send(Event::Start).await
    }

    pub async fn stop(&self) -> Result<(), ControllerError> {
        self.send(Event::Stop).await
    }

    /// Tear down any session and end the event loop
    pub async fn exit(&self) -> Result<(), ControllerError> {
        self.send(Event::Exit).await
    }

    async fn send(&self, event: Event) -> Result<(), ControllerError> {
        self.commands
            .send(event)
            .await
            .map_err(|_| ControllerError::Stopped)
    }

    /// Latest published status
    pub fn status(&self) -> StatusUpdate {
        self.status.borrow().clone()
    }

    /// Wait until the published status reaches `state`
    pub async fn wait_for(&mut self, state: SessionState) -> Result<StatusUpdate, ControllerError> {
        self.status
            .wait_for(|update| update.status == state)
            .await
            .map(|update| update.clone())
            .map_err(|_| ControllerError::Stopped)
    }
}

/// Why a setup attempt produced no session
#[derive(Debug)]
enum SetupFailure {
    Microphone(CaptureError),
    Speaker(PlaybackError),
    Transport(LiveError),
    Cancelled,
}

struct SetupOutcome {
    id: Uuid,
    result: Result<SessionLink, SetupFailure>,
}

/// Releases an acquired microphone unless it was handed on
struct MicrophoneGuard(Option<Box<dyn MicrophoneStream>>);

impl MicrophoneGuard {
    fn take(&mut self) -> Option<Box<dyn MicrophoneStream>> {
        self.0.take()
    }
}

impl Drop for MicrophoneGuard {
    fn drop(&mut self) {
        if let Some(mut microphone) = self.0.take() {
            microphone.release();
        }
    }
}

/// Everything a successful setup acquired, not yet wired together.
/// Dropping it releases all of it.
struct SessionLink {
    microphone: MicrophoneGuard,
    playback: PlaybackScheduler,
    finished_rx: mpsc::UnboundedReceiver<SourceId>,
    transport: TransportHandle,
}

/// Devices opened on the blocking pool
struct OpenedDevices {
    microphone: Box<dyn MicrophoneStream>,
    playback: PlaybackScheduler,
    finished_rx: mpsc::UnboundedReceiver<SourceId>,
}

/// Resources of the active session
struct LiveSession {
    id: Uuid,
    capture: CapturePipeline,
    playback: PlaybackScheduler,
    finished_rx: mpsc::UnboundedReceiver<SourceId>,
    transport: TransportHandle,
    packets_played: u64,
    packets_dropped: u64,
}

enum SessionSignal {
    Transport(Option<TransportEvent>),
    Finished(SourceId),
}

impl LiveSession {
    async fn next_signal(&mut self) -> SessionSignal {
        tokio::select! {
            event = self.transport.recv() => SessionSignal::Transport(event),
            Some(id) = self.finished_rx.recv() => SessionSignal::Finished(id),
        }
    }

    fn play(&mut self, packet: &crate::audio::EncodedPacket) {
        match self.playback.on_packet_received(packet) {
            Ok(start) => {
                self.packets_played += 1;
                if self.packets_played % 50 == 0 {
                    log::debug!(
                        "Session {}: {} packets played, next at {:.3}s (started {:.3}s)",
                        self.id,
                        self.packets_played,
                        self.playback.next_start_time(),
                        start
                    );
                }
            }
            Err(e) => {
                self.packets_dropped += 1;
                log::warn!("Session {}: dropping voice packet: {}", self.id, e);
            }
        }
    }

    fn teardown(mut self) {
        self.capture.stop();
        self.playback.reset();
        self.transport.close();
        log::info!(
            "Session {} released ({} packets played, {} dropped)",
            self.id,
            self.packets_played,
            self.packets_dropped
        );
    }
}

async fn next_session_signal(session: &mut Option<LiveSession>) -> SessionSignal {
    match session {
        Some(session) => session.next_signal().await,
        None => std::future::pending().await,
    }
}

/// The event loop and the resources it owns
pub struct SessionController {
    devices: Devices,
    options: SessionOptions,
    state: State,
    commands_rx: mpsc::Receiver<Event>,
    commands_tx: Option<mpsc::Sender<Event>>,
    outcomes_tx: mpsc::UnboundedSender<SetupOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<SetupOutcome>,
    status_tx: watch::Sender<StatusUpdate>,
    subscribers: Vec<mpsc::UnboundedSender<StatusUpdate>>,
    pending_setup: Option<(Uuid, CancellationToken)>,
    pending_link: Option<(Uuid, SessionLink)>,
    session: Option<LiveSession>,
}

impl SessionController {
    pub fn new(devices: Devices, options: SessionOptions) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let state = State::default();
        let (status_tx, _) = watch::channel(StatusUpdate::from_state(&state));

        Self {
            devices,
            options,
            state,
            commands_rx,
            commands_tx: Some(commands_tx),
            outcomes_tx,
            outcomes_rx,
            status_tx,
            subscribers: Vec::new(),
            pending_setup: None,
            pending_link: None,
            session: None,
        }
    }

    /// Command handle. Once every handle is dropped the loop exits.
    pub fn handle(&self) -> ControllerHandle {
        let commands = match &self.commands_tx {
            Some(tx) => tx.clone(),
            // Loop already running: hand out a handle whose sends fail
            None => mpsc::channel(1).0,
        };
        ControllerHandle {
            commands,
            status: self.status_tx.subscribe(),
        }
    }

    /// Receive every status update in order
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StatusUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Run until `exit()` or until every handle is dropped
    pub async fn run(mut self) {
        self.commands_tx = None;
        self.publish();
        log::info!("Session controller started");

        loop {
            let event = tokio::select! {
                command = self.commands_rx.recv() => Some(command.unwrap_or(Event::Exit)),
                Some(outcome) = self.outcomes_rx.recv() => self.on_setup_outcome(outcome),
                signal = next_session_signal(&mut self.session) => self.on_session_signal(signal),
            };

            let Some(event) = event else {
                continue;
            };

            let exiting = matches!(event, Event::Exit);
            self.dispatch(event);
            if exiting {
                break;
            }
        }

        self.release_all();
        log::info!("Session controller ended");
    }

    fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            log::debug!("Received event: {:?}", event);

            let old_state = self.state.session_state();
            let (next, effects) = reduce(&self.state, event);
            if old_state != next.session_state() {
                log::info!("State transition: {:?} -> {:?}", self.state, next);
            }
            self.state = next;

            for effect in effects {
                if let Some(follow_up) = self.run_effect(effect) {
                    queue.push_back(follow_up);
                }
            }
        }

        // An opened session the reducer did not accept is released here
        if let Some((id, link)) = self.pending_link.take() {
            log::info!("Discarding setup result for session {}", id);
            drop(link);
        }
    }

    fn run_effect(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::StartSession { id } => {
                self.spawn_setup(id);
                None
            }
            Effect::ActivateSession { id } => self.activate(id),
            Effect::InterruptPlayback { id } => {
                if let Some(session) = self.session.as_mut().filter(|s| s.id == id) {
                    session.playback.on_interrupt();
                }
                None
            }
            Effect::TeardownSession { id } => {
                self.teardown(id);
                None
            }
            Effect::EmitStatus => {
                self.publish();
                None
            }
        }
    }

    fn spawn_setup(&mut self, id: Uuid) {
        let token = CancellationToken::new();
        if let Some((old_id, old_token)) = self.pending_setup.replace((id, token.clone())) {
            log::debug!("Cancelling superseded setup {}", old_id);
            old_token.cancel();
        }

        let devices = self.devices.clone();
        let options = self.options.clone();
        let outcomes = self.outcomes_tx.clone();

        tokio::spawn(async move {
            let result = establish(devices, options, token).await;
            if let Err(e) = &result {
                log::warn!("Setup for session {} failed: {:?}", id, e);
            }
            // If the loop is gone the result is dropped, which releases it
            let _ = outcomes.send(SetupOutcome { id, result });
        });
    }

    fn on_setup_outcome(&mut self, outcome: SetupOutcome) -> Option<Event> {
        let SetupOutcome { id, result } = outcome;

        if matches!(&self.pending_setup, Some((pending, _)) if *pending == id) {
            self.pending_setup = None;
        }

        match result {
            Ok(link) => {
                if self.state.live_session_id() != Some(id) {
                    log::info!("Discarding stale setup result for session {}", id);
                    return None;
                }
                self.pending_link = Some((id, link));
                Some(Event::TransportOpened { id })
            }
            Err(SetupFailure::Cancelled) => None,
            Err(SetupFailure::Microphone(e)) => Some(Event::MicrophoneDenied {
                id,
                err: e.to_string(),
            }),
            Err(SetupFailure::Speaker(e)) => Some(Event::AudioDeviceFailed {
                id,
                err: e.to_string(),
            }),
            Err(SetupFailure::Transport(e)) => Some(Event::TransportOpenFailed {
                id,
                err: e.to_string(),
            }),
        }
    }

    fn on_session_signal(&mut self, signal: SessionSignal) -> Option<Event> {
        let session = self.session.as_mut()?;
        let id = session.id;

        match signal {
            SessionSignal::Finished(source) => {
                session.playback.on_source_finished(source);
                None
            }
            SessionSignal::Transport(Some(TransportEvent::Audio(packet))) => {
                session.play(&packet);
                None
            }
            SessionSignal::Transport(Some(TransportEvent::Interrupted)) => {
                Some(Event::Interrupted { id })
            }
            SessionSignal::Transport(Some(TransportEvent::TurnComplete)) => {
                log::debug!("Session {}: model turn complete", id);
                None
            }
            SessionSignal::Transport(Some(TransportEvent::Closed(reason))) => {
                Some(Event::TransportClosed { id, reason })
            }
            SessionSignal::Transport(Some(TransportEvent::Error(err))) => {
                Some(Event::TransportFailed { id, err })
            }
            SessionSignal::Transport(None) => Some(Event::TransportClosed { id, reason: None }),
        }
    }

    /// Wire capture into the transport and keep the session
    fn activate(&mut self, id: Uuid) -> Option<Event> {
        let (link_id, mut link) = self.pending_link.take()?;
        if link_id != id {
            log::warn!("Activation for {} found setup result of {}", id, link_id);
            return None;
        }

        let microphone = link.microphone.take()?;
        let outgoing = link.transport.sender();
        let started = CapturePipeline::start(microphone, &self.options.capture, move |packet| {
            outgoing.try_send(packet).is_ok()
        });

        let capture = match started {
            Ok(capture) => capture,
            Err(e) => {
                return Some(Event::MicrophoneDenied {
                    id,
                    err: e.to_string(),
                })
            }
        };

        let SessionLink {
            playback,
            finished_rx,
            transport,
            ..
        } = link;

        self.session = Some(LiveSession {
            id,
            capture,
            playback,
            finished_rx,
            transport,
            packets_played: 0,
            packets_dropped: 0,
        });
        log::info!("Session {} is live", id);
        None
    }

    fn teardown(&mut self, id: Uuid) {
        if let Some((pending, token)) = self.pending_setup.take() {
            if pending == id {
                token.cancel();
            } else {
                self.pending_setup = Some((pending, token));
            }
        }

        if matches!(&self.pending_link, Some((pending, _)) if *pending == id) {
            self.pending_link = None;
        }

        if self.session.as_ref().is_some_and(|s| s.id == id) {
            if let Some(session) = self.session.take() {
                session.teardown();
            }
        }
    }

    fn release_all(&mut self) {
        if let Some((_, token)) = self.pending_setup.take() {
            token.cancel();
        }
        self.pending_link = None;
        if let Some(session) = self.session.take() {
            session.teardown();
        }
    }

    fn publish(&mut self) {
        let update = StatusUpdate::from_state(&self.state);
        log::info!("Status: {}", update.message);

        self.status_tx.send_replace(update.clone());
        self.subscribers
            .retain(|subscriber| subscriber.send(update.clone()).is_ok());
    }
}

/// Acquire devices and open the transport concurrently.
///
/// Whatever was acquired is released before an error is returned.
async fn establish(
    devices: Devices,
    options: SessionOptions,
    token: CancellationToken,
) -> Result<SessionLink, SetupFailure> {
    let Devices {
        microphone,
        speaker,
        transport,
    } = devices;

    let playback_rate = options.playback_sample_rate;
    let channels = options.playback_channels;
    let acquire = tokio::task::spawn_blocking(move || {
        open_devices(microphone.as_ref(), speaker.as_ref(), playback_rate, channels)
    });

    let open = async {
        tokio::select! {
            _ = token.cancelled() => Err(SetupFailure::Cancelled),
            result = transport.open(options.live.clone()) => result.map_err(SetupFailure::Transport),
        }
    };

    let (acquired, opened) = tokio::join!(acquire, open);
    let acquired = acquired.unwrap_or_else(|e| {
        Err(SetupFailure::Microphone(CaptureError::StreamFailed(
            e.to_string(),
        )))
    });

    match (acquired, opened) {
        (Ok(devices), Ok(transport)) => {
            let link = SessionLink {
                microphone: MicrophoneGuard(Some(devices.microphone)),
                playback: devices.playback,
                finished_rx: devices.finished_rx,
                transport,
            };
            if token.is_cancelled() {
                // Dropping the link releases everything
                return Err(SetupFailure::Cancelled);
            }
            Ok(link)
        }
        (Ok(mut devices), Err(e)) => {
            devices.microphone.release();
            Err(e)
        }
        // Device failures win: the microphone is checked first
        (Err(e), _) => Err(e),
    }
}

fn open_devices(
    microphone: &dyn Microphone,
    speaker: &dyn Speaker,
    playback_rate: u32,
    channels: usize,
) -> Result<OpenedDevices, SetupFailure> {
    let mut stream = microphone.acquire().map_err(SetupFailure::Microphone)?;

    let (finished_tx, finished_rx) = mpsc::unbounded_channel();
    let device = match speaker.open(playback_rate, finished_tx) {
        Ok(device) => device,
        Err(e) => {
            stream.release();
            return Err(SetupFailure::Speaker(e));
        }
    };

    Ok(OpenedDevices {
        microphone: stream,
        playback: PlaybackScheduler::new(device, channels),
        finished_rx,
    })
}
