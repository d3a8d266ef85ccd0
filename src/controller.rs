//! Call orchestration: one call at a time, media held for exactly as long as
//! the call, transport events reconciled against the negotiation state.

use crate::config::CallConfig;
use crate::errors::{CallError, NegotiationError};
use crate::identity::IdentityProvider;
use crate::logger::EventEmitter;
use crate::media::{CaptureBackend, MediaLease, MediaSource};
use crate::peer::connection::WebRtcTransportFactory;
use crate::peer::ice::PendingCandidates;
use crate::peer::negotiator::SessionNegotiator;
use crate::peer::state::NegotiationState;
use crate::peer::transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};
use crate::peer::types::{
    CallEvent, EndReason, IceCandidate, IncomingOffer, MediaTrack, Participant, Role, SdpKind,
    SignalEnvelope, SignalMessage, TrackKind,
};
use crate::session::Session;
use crate::signaling::SignalingChannel;
use crate::utils::random_id;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type SharedNegotiator = Arc<AsyncMutex<SessionNegotiator>>;

struct ActiveCall {
    generation: u64,
    session_id: String,
    negotiator: SharedNegotiator,
    cancel: CancellationToken,
    grace: Option<CancellationToken>,
    // dropping the call releases local capture
    _lease: MediaLease,
}

enum Slot {
    Empty,
    /// Reserved by a setup that has not opened its transport yet.
    Pending {
        generation: u64,
        session_id: String,
        cancel: CancellationToken,
    },
    Active(ActiveCall),
}

struct Shared {
    config: CallConfig,
    media: Arc<MediaSource>,
    transports: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingChannel>,
    identity: Arc<dyn IdentityProvider>,
    events: EventEmitter,
    slot: Mutex<Slot>,
    generation: AtomicU64,
    pending: Mutex<PendingCandidates>,
}

/// Drives a single participant's calls.
///
/// Cheap to clone; clones share the same call slot.
#[derive(Clone)]
pub struct CallController {
    inner: Arc<Shared>,
}

/// Races `fut` against the session's cancellation token.
async fn guarded<T, E>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, CallError>
where
    E: Into<CallError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CallError::Cancelled),
        res = fut => res.map_err(Into::into),
    }
}

impl CallController {
    pub fn new(
        config: CallConfig,
        media: Arc<MediaSource>,
        transports: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingChannel>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let events = EventEmitter::new(config.session.event_capacity);
        let pending = PendingCandidates::new(
            config.session.max_pending_candidates,
            config.session.max_pending_sessions,
        );
        Self {
            inner: Arc::new(Shared {
                config,
                media,
                transports,
                signaling,
                identity,
                events,
                slot: Mutex::new(Slot::Empty),
                generation: AtomicU64::new(0),
                pending: Mutex::new(pending),
            }),
        }
    }

    /// Controller backed by `webrtc` peer connections.
    pub fn with_webrtc(
        config: CallConfig,
        capture: Arc<dyn CaptureBackend>,
        signaling: Arc<dyn SignalingChannel>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let transports = Arc::new(WebRtcTransportFactory::new(config.ice.clone()));
        Self::new(
            config,
            Arc::new(MediaSource::new(capture)),
            transports,
            signaling,
            identity,
        )
    }

    /// Controller capturing from the microphone and camera named in `config.media`.
    #[cfg(feature = "devices")]
    pub fn with_devices(
        config: CallConfig,
        signaling: Arc<dyn SignalingChannel>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let capture = Arc::new(crate::device::DeviceCapture::from_config(&config.media));
        Self::with_webrtc(config, capture, signaling, identity)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn local_participant(&self) -> Participant {
        self.inner.identity.participant()
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    /// Negotiation state of the current call, `Idle` when there is none.
    pub async fn state(&self) -> NegotiationState {
        let Some(n) = self.current_negotiator() else {
            return NegotiationState::Idle;
        };
        let state = n.lock().await.state();
        state
    }

    /// Snapshot of the current session.
    pub async fn session(&self) -> Option<Session> {
        let n = self.current_negotiator()?;
        let session = n.lock().await.session().clone();
        Some(session)
    }

    /// Short code both participants can compare once descriptions are exchanged.
    pub async fn verification_code(&self) -> Option<String> {
        let n = self.current_negotiator()?;
        let code = n.lock().await.verification_code();
        code
    }

    /// Remote candidates held for a session that has not been accepted yet.
    pub fn pending_candidates(&self, session_id: &str) -> usize {
        self.pending().len(session_id)
    }

    /// Whether a call is active or being set up.
    pub fn is_busy(&self) -> bool {
        !matches!(*self.slot(), Slot::Empty)
    }

    /// Starts an outgoing call and returns its session id once the offer is sent.
    pub async fn start_call(&self, with_video: bool) -> Result<String, CallError> {
        let session_id = random_id();
        let (generation, cancel) = self.reserve(&session_id)?;
        log::info!("starting call {session_id} (video: {with_video})");

        let setup = async {
            let negotiator = self
                .open_session(Role::Caller, &session_id, generation, &cancel, with_video)
                .await?;
            let state = guarded(&cancel, async { negotiator.lock().await.create_offer().await }).await?;
            self.inner.events.emit_state(state);
            let state = guarded(&cancel, async { negotiator.lock().await.send_offer().await }).await?;
            self.inner.events.emit_state(state);
            Ok::<(), CallError>(())
        };
        let outcome = setup.await;
        match outcome {
            Ok(()) => {
                log::info!("call {session_id} ringing");
                Ok(session_id)
            }
            Err(e) => Err(self.abort_setup(generation, e).await),
        }
    }

    /// Accepts an offer surfaced through [`CallEvent::IncomingCall`] and answers it.
    ///
    /// Video is requested when the offer carries a video section.
    pub async fn accept_incoming(&self, offer: IncomingOffer) -> Result<String, CallError> {
        offer.description.validate(SdpKind::Offer)?;
        let (generation, cancel) = self.reserve(&offer.session_id)?;
        let IncomingOffer {
            session_id,
            from,
            description,
        } = offer;
        let want_video = description.has_video();
        log::info!(
            "accepting call {session_id} from {} (video: {want_video})",
            from.display_name
        );

        let setup = async {
            let negotiator = self
                .open_session(Role::Callee, &session_id, generation, &cancel, want_video)
                .await?;
            let state = guarded(&cancel, async {
                let mut n = negotiator.lock().await;
                let state = n.receive_offer(description).await?;
                let buffered = self.take_pending(&session_id);
                if !buffered.is_empty() {
                    log::debug!("applying {} buffered candidate(s)", buffered.len());
                }
                for c in buffered {
                    if let Err(e) = n.apply_remote_candidate(c).await {
                        log::warn!("buffered candidate rejected: {e}");
                    }
                }
                Ok::<_, NegotiationError>(state)
            })
            .await?;
            self.inner.events.emit_state(state);
            let state = guarded(&cancel, async { negotiator.lock().await.create_answer().await }).await?;
            self.inner.events.emit_state(state);
            Ok::<(), CallError>(())
        };
        let outcome = setup.await;
        match outcome {
            Ok(()) => Ok(session_id),
            Err(e) => Err(self.abort_setup(generation, e).await),
        }
    }

    /// Hangs up. Safe to call any number of times, with or without a call.
    /// Returns whether there was anything to tear down.
    pub async fn end_call(&self) -> bool {
        self.teardown(None, EndReason::Hangup).await
    }

    /// Flips the microphone. Returns the new flag, `None` when the call has
    /// no local audio track.
    pub fn toggle_audio(&self) -> Result<Option<bool>, CallError> {
        self.toggle(TrackKind::Audio)
    }

    /// Flips the camera. Returns the new flag, `None` for an audio-only call.
    pub fn toggle_video(&self) -> Result<Option<bool>, CallError> {
        self.toggle(TrackKind::Video)
    }

    /// Dispatches one inbound signaling message.
    pub async fn handle_signal(&self, envelope: SignalEnvelope) -> Result<(), CallError> {
        let SignalEnvelope {
            session_id,
            from,
            message,
            ..
        } = envelope;
        match message {
            SignalMessage::Offer(description) => {
                description.validate(SdpKind::Offer)?;
                self.pending().offered(&session_id);
                self.inner.events.emit_incoming(IncomingOffer {
                    session_id,
                    from,
                    description,
                });
                Ok(())
            }
            SignalMessage::Answer(answer) => {
                let (generation, negotiator) = self
                    .negotiator_for(&session_id)
                    .ok_or(NegotiationError::SessionClosed)?;
                let res = negotiator.lock().await.receive_answer(answer).await;
                match res {
                    Ok(state) => {
                        self.inner.events.emit_state(state);
                        Ok(())
                    }
                    // a redelivered answer must not kill a healthy call
                    Err(e @ NegotiationError::OutOfSequence { .. }) => Err(e.into()),
                    Err(e) => {
                        log::warn!("answer for {session_id} rejected: {e}");
                        self.teardown(Some(generation), EndReason::NegotiationFailed(e.to_string()))
                            .await;
                        Err(e.into())
                    }
                }
            }
            SignalMessage::Candidate(c) => {
                let Some((_, negotiator)) = self.negotiator_for(&session_id) else {
                    self.buffer_candidate(&session_id, c);
                    return Ok(());
                };
                let mut n = negotiator.lock().await;
                if n.state() == NegotiationState::Idle {
                    // offer accepted but not applied yet
                    self.buffer_candidate(&session_id, c);
                    return Ok(());
                }
                n.apply_remote_candidate(c).await?;
                Ok(())
            }
        }
    }

    /// Feeds every message from the signaling subscription into
    /// [`CallController::handle_signal`]. Ends when the channel closes or the
    /// controller is dropped.
    pub fn spawn_signaling_loop(&self) -> JoinHandle<()> {
        let mut inbound = self.inner.signaling.subscribe();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let controller = CallController { inner };
                if let Err(e) = controller.handle_signal(envelope).await {
                    log::warn!("inbound signal dropped: {e}");
                }
            }
            log::debug!("signaling loop finished");
        })
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, PendingCandidates> {
        self.inner.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn reserve(&self, session_id: &str) -> Result<(u64, CancellationToken), CallError> {
        let mut slot = self.slot();
        if !matches!(*slot, Slot::Empty) {
            log::warn!("call rejected: another call is active");
            return Err(CallError::AlreadyActive);
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        *slot = Slot::Pending {
            generation,
            session_id: session_id.to_string(),
            cancel: cancel.clone(),
        };
        Ok((generation, cancel))
    }

    /// Acquires media, opens the transport, publishes the call and binds the tracks.
    async fn open_session(
        &self,
        role: Role,
        session_id: &str,
        generation: u64,
        cancel: &CancellationToken,
        want_video: bool,
    ) -> Result<SharedNegotiator, CallError> {
        let lease = guarded(
            cancel,
            MediaLease::acquire(self.inner.media.clone(), want_video),
        )
        .await?;
        for track in lease.tracks() {
            self.inner.events.emit_local_track(track);
        }
        let tracks: Vec<MediaTrack> = lease.tracks().to_vec();

        let (transport, events) = guarded(cancel, self.inner.transports.open(session_id)).await?;
        let session = Session::new(session_id.to_string(), generation, role);
        let negotiator = Arc::new(AsyncMutex::new(SessionNegotiator::new(
            session,
            self.inner.identity.participant(),
            transport.clone(),
            self.inner.signaling.clone(),
        )));

        let call = ActiveCall {
            generation,
            session_id: session_id.to_string(),
            negotiator: negotiator.clone(),
            cancel: cancel.clone(),
            grace: None,
            _lease: lease,
        };
        if !self.install(call) {
            close_quietly(transport.as_ref()).await;
            return Err(CallError::Cancelled);
        }
        self.spawn_event_pump(generation, negotiator.clone(), events, cancel.clone());

        guarded(cancel, async { negotiator.lock().await.bind_tracks(&tracks).await }).await?;
        Ok(negotiator)
    }

    /// Swaps the reservation for the live call. False if the reservation was
    /// cancelled meanwhile; the call is dropped then.
    fn install(&self, call: ActiveCall) -> bool {
        let mut slot = self.slot();
        match &*slot {
            Slot::Pending { generation, .. } if *generation == call.generation => {
                *slot = Slot::Active(call);
                true
            }
            _ => false,
        }
    }

    /// Cleans up after a failed setup. Cancellation means `end_call` already did.
    async fn abort_setup(&self, generation: u64, err: CallError) -> CallError {
        if err != CallError::Cancelled {
            log::warn!("call setup failed: {err}");
            self.teardown(Some(generation), EndReason::SetupFailed(err.to_string()))
                .await;
        }
        err
    }

    /// The one teardown path. With `generation` set, only that call is torn down.
    async fn teardown(&self, generation: Option<u64>, reason: EndReason) -> bool {
        let taken = {
            let mut slot = self.slot();
            let current = match &*slot {
                Slot::Empty => return false,
                Slot::Pending { generation, .. } => *generation,
                Slot::Active(call) => call.generation,
            };
            if generation.is_some_and(|g| g != current) {
                return false;
            }
            std::mem::replace(&mut *slot, Slot::Empty)
        };

        let session_id = match taken {
            Slot::Empty => return false,
            Slot::Pending {
                cancel, session_id, ..
            } => {
                cancel.cancel();
                session_id
            }
            Slot::Active(call) => {
                call.cancel.cancel();
                if let Some(grace) = &call.grace {
                    grace.cancel();
                }
                let closed = call.negotiator.lock().await.close().await;
                if closed {
                    self.inner.events.emit_state(NegotiationState::Closed);
                }
                log::info!("call {} torn down", call.session_id);
                call.session_id.clone()
            }
        };
        // other sessions' buffered candidates stay for a later accept
        self.pending().forget(&session_id);
        self.inner.events.emit_ended(reason);
        true
    }

    fn current_negotiator(&self) -> Option<SharedNegotiator> {
        match &*self.slot() {
            Slot::Active(call) => Some(call.negotiator.clone()),
            _ => None,
        }
    }

    fn negotiator_at(&self, generation: u64) -> Option<SharedNegotiator> {
        match &*self.slot() {
            Slot::Active(call) if call.generation == generation => Some(call.negotiator.clone()),
            _ => None,
        }
    }

    fn negotiator_for(&self, session_id: &str) -> Option<(u64, SharedNegotiator)> {
        match &*self.slot() {
            Slot::Active(call) if call.session_id == session_id => {
                Some((call.generation, call.negotiator.clone()))
            }
            _ => None,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        match &*self.slot() {
            Slot::Active(call) => call.generation == generation,
            Slot::Pending { generation: g, .. } => *g == generation,
            Slot::Empty => false,
        }
    }

    fn buffer_candidate(&self, session_id: &str, c: IceCandidate) {
        let mut pending = self.pending();
        if pending.push(session_id, c) {
            log::debug!(
                "buffered candidate for unknown session {session_id} ({} held)",
                pending.len(session_id)
            );
        }
    }

    fn take_pending(&self, session_id: &str) -> Vec<IceCandidate> {
        self.pending().take(session_id)
    }

    fn toggle(&self, kind: TrackKind) -> Result<Option<bool>, CallError> {
        if !self.is_busy() {
            return Err(CallError::NoActiveCall);
        }
        let Some(enabled) = self.inner.media.is_enabled(kind).map(|on| !on) else {
            return Ok(None);
        };
        if !self.inner.media.set_enabled(kind, enabled) {
            return Ok(None);
        }
        log::info!("local {kind} {}", if enabled { "enabled" } else { "disabled" });
        self.inner.events.emit_media_state(kind, enabled);
        Ok(Some(enabled))
    }

    /// One task per session delivers transport events in arrival order.
    fn spawn_event_pump(
        &self,
        generation: u64,
        negotiator: SharedNegotiator,
        mut events: TransportEvents,
        cancel: CancellationToken,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if !this.is_current(generation) {
                    log::debug!("dropping stale transport event {:?}", event);
                    break;
                }
                this.on_transport_event(generation, &negotiator, event).await;
            }
            log::debug!("transport event pump for generation {generation} stopped");
        });
    }

    async fn on_transport_event(
        &self,
        generation: u64,
        negotiator: &SharedNegotiator,
        event: TransportEvent,
    ) {
        match event {
            TransportEvent::LocalCandidate(c) => {
                let res = negotiator.lock().await.on_local_candidate(c).await;
                if let Err(e) = res {
                    self.inner.events.emit_signaling_failed(e.to_string());
                }
            }
            TransportEvent::GatheringComplete => negotiator.lock().await.gathering_complete(),
            TransportEvent::PathEstablished => {
                let res = negotiator.lock().await.path_established();
                match res {
                    Ok(state) => {
                        self.cancel_grace(generation);
                        self.inner.events.emit_state(state);
                    }
                    Err(e) => log::debug!("path established ignored: {e}"),
                }
            }
            TransportEvent::PathLost => self.on_path_lost(generation, negotiator).await,
            TransportEvent::PathFailed => {
                let failed = {
                    let mut n = negotiator.lock().await;
                    match n.state() {
                        NegotiationState::Connected => None,
                        // grace timer is already running
                        NegotiationState::Disconnected => return,
                        s if s.is_terminal() => return,
                        _ => Some(n.fail()),
                    }
                };
                match failed {
                    None => self.on_path_lost(generation, negotiator).await,
                    Some(Ok(state)) => {
                        log::warn!("transport failed before the call connected");
                        self.inner.events.emit_state(state);
                        self.teardown(Some(generation), EndReason::ConnectionFailed)
                            .await;
                    }
                    Some(Err(e)) => log::debug!("path failure ignored: {e}"),
                }
            }
            TransportEvent::RemoteTrack(track) => {
                let res = negotiator.lock().await.set_remote_track(track.clone());
                match res {
                    Ok(()) => self.inner.events.emit_remote_track(&track),
                    Err(e) => log::debug!("remote track ignored: {e}"),
                }
            }
        }
    }

    async fn on_path_lost(&self, generation: u64, negotiator: &SharedNegotiator) {
        let res = negotiator.lock().await.path_lost();
        let state = match res {
            Ok(state) => state,
            Err(e) => {
                log::debug!("path lost ignored: {e}");
                return;
            }
        };
        self.inner.events.emit_state(state);

        let grace = CancellationToken::new();
        {
            let mut slot = self.slot();
            match &mut *slot {
                Slot::Active(call) if call.generation == generation => {
                    if let Some(old) = call.grace.replace(grace.clone()) {
                        old.cancel();
                    }
                }
                _ => return,
            }
        }

        let period = self.inner.config.session.grace_period();
        log::warn!("path lost, waiting {:?} for recovery", period);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = grace.cancelled() => log::debug!("grace timer for generation {generation} cancelled"),
                _ = tokio::time::sleep(period) => this.on_grace_expired(generation).await,
            }
        });
    }

    async fn on_grace_expired(&self, generation: u64) {
        let Some(negotiator) = self.negotiator_at(generation) else {
            return;
        };
        let res = negotiator.lock().await.grace_expired();
        match res {
            Ok(state) => {
                log::warn!("no recovery within the grace period");
                self.inner.events.emit_state(state);
                self.teardown(Some(generation), EndReason::ConnectionFailed)
                    .await;
            }
            Err(e) => log::debug!("grace expiry ignored: {e}"),
        }
    }

    fn cancel_grace(&self, generation: u64) {
        let mut slot = self.slot();
        if let Slot::Active(call) = &mut *slot {
            if call.generation == generation {
                if let Some(grace) = call.grace.take() {
                    log::info!("path recovered within the grace period");
                    grace.cancel();
                }
            }
        }
    }
}

async fn close_quietly(transport: &dyn PeerTransport) {
    if let Err(e) = transport.close().await {
        log::debug!("closing abandoned transport: {e}");
    }
}
