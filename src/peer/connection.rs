use crate::config::IceConfig;
use crate::errors::TransportError;
use crate::peer::transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};
use crate::peer::types::{
    IceCandidate, MediaSample, MediaTrack, SdpKind, ServerConfig, SessionDescription, TrackKind,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::media::Sample;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

const STREAM_ID: &str = "peercall";

/// Opens `webrtc` peer connections configured from [`IceConfig`].
pub struct WebRtcTransportFactory {
    ice: IceConfig,
}

impl WebRtcTransportFactory {
    pub fn new(ice: IceConfig) -> Self {
        Self { ice }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn open(
        &self,
        session_id: &str,
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        let (transport, events) = WebRtcTransport::new(&self.ice, session_id).await?;
        Ok((Arc::new(transport), events))
    }
}

/// [`PeerTransport`] over an `RTCPeerConnection`.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    // stops the per-track sample and RTCP tasks
    closed: CancellationToken,
}

impl WebRtcTransport {
    pub async fn new(
        ice: &IceConfig,
        session_id: &str,
    ) -> Result<(Self, TransportEvents), TransportError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(ice)).await?);
        let (tx, rx) = mpsc::unbounded_channel();

        let cand_tx = tx.clone();
        let sid = session_id.to_string();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let _ = cand_tx.send(TransportEvent::LocalCandidate(init.into()));
                    }
                    Err(e) => log::warn!("{sid}: unusable local candidate: {e}"),
                },
                None => {
                    // null candidate marks the end of gathering
                    let _ = cand_tx.send(TransportEvent::GatheringComplete);
                }
            }
            Box::pin(async {})
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            log::debug!("ICE gathering state changed to: {:?}", state);
            Box::pin(async {})
        }));

        let state_tx = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            log::debug!("peer connection state changed to: {:?}", st);
            let event = match st {
                RTCPeerConnectionState::Connected => Some(TransportEvent::PathEstablished),
                RTCPeerConnectionState::Disconnected => Some(TransportEvent::PathLost),
                RTCPeerConnectionState::Failed => Some(TransportEvent::PathFailed),
                _ => None,
            };
            if let Some(event) = event {
                let _ = state_tx.send(event);
            }
            Box::pin(async {})
        }));

        let track_tx = tx;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            let _ = track_tx.send(TransportEvent::RemoteTrack(MediaTrack::remote(
                track.id(),
                kind,
            )));
            Box::pin(async {})
        }));

        Ok((
            Self {
                pc,
                closed: CancellationToken::new(),
            },
            rx,
        ))
    }

    async fn local_description(&self, kind: SdpKind) -> Result<SessionDescription, TransportError> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Backend("local description missing".into()))?;
        Ok(SessionDescription {
            kind,
            sdp: desc.sdp,
        })
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        // capture backends encode Opus and H.264
        let mime = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_H264,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            track.id().to_owned(),
            STREAM_ID.to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // incoming RTCP must be drained for the interceptors to work
        let stop = self.closed.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    res = sender.read(&mut buf) => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let id = track.id().to_owned();
        let samples = track.subscribe_samples();
        let stop = self.closed.clone();
        tokio::spawn(async move {
            let written = forward_samples(samples, stop, move |sample| {
                let local = Arc::clone(&local);
                async move { local.write_sample(&sample).await }
            })
            .await;
            log::debug!("track {id}: forwarded {written} sample(s)");
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.local_description(SdpKind::Offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description(SdpKind::Answer).await
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), TransportError> {
        let rtc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone())?,
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone())?,
        };
        self.pc.set_remote_description(rtc).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit::from(candidate))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        self.pc.close().await?;
        Ok(())
    }
}

/// Copies encoded samples from a local track into its RTP track until the
/// feed closes or `stop` fires. Returns how many were written.
///
/// Muted tracks never reach the feed, see [`MediaTrack::push_sample`].
async fn forward_samples<F, Fut>(
    mut samples: broadcast::Receiver<MediaSample>,
    stop: CancellationToken,
    mut write: F,
) -> usize
where
    F: FnMut(Sample) -> Fut,
    Fut: Future<Output = Result<(), webrtc::Error>>,
{
    let mut written = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = samples.recv() => next,
        };
        let sample = match next {
            Ok(sample) => sample,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::debug!("sender fell behind, skipped {skipped} sample(s)");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let sample = Sample {
            data: sample.data,
            duration: sample.duration,
            ..Default::default()
        };
        if let Err(e) = write(sample).await {
            log::warn!("writing local sample failed: {e}");
            break;
        }
        written += 1;
    }
    written
}

/// Peer connection configuration from the configured ICE servers.
pub fn rtc_config(ice: &IceConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(&ice.servers),
        ice_candidate_pool_size: ice.candidate_pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}
