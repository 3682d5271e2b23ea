//! WebRTC peer connections and the RTP→PCM track source.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use audiopus::coder::Decoder;
use audiopus::{Channels, MutSignals, SampleRate};
use confab_audio::{AudioError, DecodedFrame};
use confab_pipeline::{run_track, PipelineConfig, TrackSource};
use confab_session::keys::OUTBOUND_SOCKET;
use confab_session::{ResourceKey, SessionContext};
use confab_signal::{parse_candidate, IceCandidateInit, SessionDescription, WireMessage};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

pub const PEER_CONNECTION: ResourceKey<Arc<RTCPeerConnection>> =
    ResourceKey::new("peer_connection");

/// Opus always decodes at 48 kHz; maximum frame is 120 ms.
const OPUS_SAMPLE_RATE: u32 = 48_000;
const OPUS_CHANNELS: usize = 2;
const MAX_SAMPLES_PER_CHANNEL: usize = 5_760;

/// Answer a client offer: build the peer connection, wire the audio track
/// into the session pipeline, and return the local description.
pub async fn handle_offer(
    ctx: &SessionContext,
    offer: SessionDescription,
    pipeline_config: PipelineConfig,
) -> anyhow::Result<SessionDescription> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let api = APIBuilder::new().with_media_engine(media).build();
    let peer_connection = Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .context("peer connection setup failed")?,
    );

    let track_ctx = ctx.clone();
    peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
        let ctx = track_ctx.clone();
        Box::pin(async move {
            if track.kind() != RTPCodecType::Audio {
                tracing::debug!(kind = %track.kind(), "ignoring non-audio track");
                return;
            }
            let source = match RtpTrackSource::new(track) {
                Ok(source) => source,
                Err(error) => {
                    tracing::error!(session_id = %ctx.session_id(), %error, "opus decoder setup failed");
                    return;
                }
            };
            let pipeline_ctx = ctx.clone();
            if let Err(error) = ctx
                .spawn(run_track(pipeline_ctx, source, pipeline_config))
                .await
            {
                tracing::error!(session_id = %ctx.session_id(), %error, "could not start audio pipeline");
            }
        })
    }));

    // Trickle our own candidates back over signaling as they gather.
    let ice_ctx = ctx.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let ctx = ice_ctx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(error) => {
                    tracing::warn!(session_id = %ctx.session_id(), %error, "candidate serialization failed");
                    return;
                }
            };
            let socket = match ctx.get(OUTBOUND_SOCKET).await {
                Ok(Some(socket)) => socket,
                _ => return,
            };
            let message = WireMessage::ice_candidate(IceCandidateInit {
                candidate: init.candidate,
                sdp_mid: init.sdp_mid,
                sdp_mline_index: init.sdp_mline_index,
            });
            if let Err(error) = socket.send(message).await {
                tracing::debug!(session_id = %ctx.session_id(), %error, "candidate send failed");
            }
        })
    }));

    let remote = RTCSessionDescription::offer(offer.sdp)?;
    peer_connection.set_remote_description(remote).await?;
    let answer = peer_connection.create_answer(None).await?;
    peer_connection.set_local_description(answer).await?;
    let local = peer_connection
        .local_description()
        .await
        .ok_or_else(|| anyhow!("local description missing after answer"))?;

    ctx.register(PEER_CONNECTION, Arc::clone(&peer_connection))
        .await?;

    Ok(SessionDescription {
        sdp: local.sdp,
        kind: local.sdp_type.to_string(),
    })
}

/// Validate and add a remote ICE candidate.
pub async fn handle_ice_candidate(
    ctx: &SessionContext,
    candidate: IceCandidateInit,
) -> anyhow::Result<()> {
    let peer_connection = ctx
        .get(PEER_CONNECTION)
        .await?
        .ok_or_else(|| anyhow!("no peer connection for this session yet"))?;

    // Grammar check before the ICE agent sees the line.
    match parse_candidate(&candidate.candidate)? {
        None => {
            tracing::debug!(session_id = %ctx.session_id(), "end of remote ICE candidates");
            return Ok(());
        }
        Some(fields) => {
            tracing::debug!(
                session_id = %ctx.session_id(),
                kind = %fields.kind,
                protocol = %fields.protocol,
                "adding remote ICE candidate"
            );
        }
    }

    peer_connection
        .add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        })
        .await?;
    Ok(())
}

/// Close the session's peer connection, ending its audio track. The
/// pipeline then drains and finalizes before teardown releases resources.
pub async fn close_peer_connection(ctx: &SessionContext) {
    match ctx.get(PEER_CONNECTION).await {
        Ok(Some(peer_connection)) => {
            if let Err(error) = peer_connection.close().await {
                tracing::warn!(session_id = %ctx.session_id(), %error, "peer connection close failed");
            }
        }
        Ok(None) => {}
        Err(error) => {
            tracing::debug!(session_id = %ctx.session_id(), %error, "peer connection lookup failed");
        }
    }
}

/// Decodes a remote Opus track into interleaved stereo PCM frames.
pub struct RtpTrackSource {
    track: Arc<TrackRemote>,
    decoder: Decoder,
}

impl RtpTrackSource {
    pub fn new(track: Arc<TrackRemote>) -> anyhow::Result<Self> {
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Stereo)
            .map_err(|error| anyhow!("opus decoder: {error}"))?;
        Ok(Self { track, decoder })
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, AudioError> {
        let mut output = vec![0i16; MAX_SAMPLES_PER_CHANNEL * OPUS_CHANNELS];
        let packet = audiopus::packet::Packet::try_from(payload)
            .map_err(|error| AudioError::Transport(format!("invalid opus packet: {error}")))?;
        let signals = MutSignals::try_from(output.as_mut_slice())
            .map_err(|error| AudioError::Transport(format!("opus output buffer: {error}")))?;
        let per_channel = self
            .decoder
            .decode(Some(packet), signals, false)
            .map_err(|error| AudioError::Transport(format!("opus decode: {error}")))?;
        output.truncate(per_channel * OPUS_CHANNELS);
        Ok(output)
    }
}

#[async_trait]
impl TrackSource for RtpTrackSource {
    async fn next_frame(&mut self) -> confab_audio::Result<Option<DecodedFrame>> {
        loop {
            let (packet, _attributes) = match self.track.read_rtp().await {
                Ok(read) => read,
                Err(error) => {
                    // The track ends when the peer connection closes; any
                    // read error is end-of-stream for the pipeline.
                    tracing::debug!(%error, "rtp track finished");
                    return Ok(None);
                }
            };
            if packet.payload.is_empty() {
                continue;
            }
            let samples = self.decode(&packet.payload)?;
            return Ok(Some(DecodedFrame {
                samples,
                channels: OPUS_CHANNELS as u16,
                sample_rate: OPUS_SAMPLE_RATE,
                interleaved: true,
            }));
        }
    }
}
