//! WebRTC peer-connection processing.
//!
//! One peer connection per session. The processor answers inbound SDP
//! offers (and generates offers for outbound calls), advertises Opus-only
//! audio, forwards decoded caller audio to the model adapter, and feeds the
//! recording pipeline with the raw RTP stream.
//!
//! SDP negotiation failure is fatal for the session. ICE disconnection only
//! raises an `ICEConnectionChanged` event — no reconnection is attempted,
//! the caller re-initiates.

pub mod ice;
mod writer;

pub use ice::{IceProvider, IceServerEntry, WebRtcClientConfig};
pub use writer::{OpusWriter, WebRtcTrackWriter};

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::events::{Event, EventBus, EventData, EventType};
use crate::recording::{AudioDirection, Recorder};

/// Opus parameters advertised in every local description.
pub const OPUS_FMTP: &str = "minptime=20;useinbandfec=1;usedtx=0";

/// Session-layer hooks driving the inbound forwarder.
pub struct InboundHooks {
    /// Whether a decoded frame may be forwarded right now. Covers both the
    /// closed flag and the greeting policy.
    pub gate: Arc<dyn Fn() -> bool + Send + Sync>,
    /// Receives decoded PCM16 bytes at `sample_rate`.
    pub sink: Arc<dyn Fn(Vec<u8>) + Send + Sync>,
    /// Decode rate expected by the model provider.
    pub sample_rate: u32,
    /// Marks the session as having produced caller audio.
    pub on_first_audio: Arc<dyn Fn() + Send + Sync>,
}

pub struct WebRtcProcessor {
    api: API,
    ice: Arc<IceProvider>,
    event_bus: Arc<EventBus>,
    recorder: Arc<Recorder>,
    peers: Mutex<HashMap<String, Arc<RTCPeerConnection>>>,
}

impl WebRtcProcessor {
    pub fn new(
        ice: Arc<IceProvider>,
        event_bus: Arc<EventBus>,
        recorder: Arc<Recorder>,
    ) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 1,
                    sdp_fmtp_line: OPUS_FMTP.to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice,
            event_bus,
            recorder,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Answer an inbound offer. Returns the munged local description and
    /// the writer for outbound model audio.
    pub async fn process_sdp_offer(
        &self,
        session_id: &str,
        offer_sdp: &str,
        hooks: InboundHooks,
    ) -> anyhow::Result<(String, Arc<WebRtcTrackWriter>)> {
        self.event_bus.publish(
            Event::new(EventType::SdpOfferReceived, session_id).with_data(EventData::Sdp {
                sdp: offer_sdp.to_owned(),
            }),
        );

        let (pc, track_writer) = self.build_peer(session_id, hooks).await?;

        let offer = RTCSessionDescription::offer(offer_sdp.to_owned())
            .map_err(|e| anyhow::anyhow!("malformed SDP offer: {e}"))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| anyhow::anyhow!("remote description rejected: {e}"))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| anyhow::anyhow!("failed to create answer: {e}"))?;

        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(|e| anyhow::anyhow!("failed to set local description: {e}"))?;
        let _ = gather_complete.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| anyhow::anyhow!("local description missing after gathering"))?;
        let munged = force_opus_params(&local.sdp);

        self.event_bus.publish(
            Event::new(EventType::SdpAnswerGenerated, session_id).with_data(EventData::Sdp {
                sdp: munged.clone(),
            }),
        );
        Ok((munged, track_writer))
    }

    /// Generate an offer for an outbound call. The answer arrives later via
    /// [`WebRtcProcessor::process_sdp_answer`].
    pub async fn generate_sdp_offer(
        &self,
        session_id: &str,
        hooks: InboundHooks,
    ) -> anyhow::Result<(String, Arc<WebRtcTrackWriter>)> {
        let (pc, track_writer) = self.build_peer(session_id, hooks).await?;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| anyhow::anyhow!("failed to create offer: {e}"))?;

        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .map_err(|e| anyhow::anyhow!("failed to set local description: {e}"))?;
        let _ = gather_complete.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| anyhow::anyhow!("local description missing after gathering"))?;
        Ok((force_opus_params(&local.sdp), track_writer))
    }

    /// Complete an outbound negotiation with the callee's answer.
    pub async fn process_sdp_answer(&self, session_id: &str, answer_sdp: &str) -> anyhow::Result<()> {
        let pc = self
            .peers
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no peer connection for {session_id}"))?;
        let answer = RTCSessionDescription::answer(answer_sdp.to_owned())
            .map_err(|e| anyhow::anyhow!("malformed SDP answer: {e}"))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| anyhow::anyhow!("remote answer rejected: {e}"))?;
        Ok(())
    }

    /// Close and forget a session's peer connection. Idempotent.
    pub async fn cleanup(&self, session_id: &str) {
        let pc = self.peers.lock().remove(session_id);
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                tracing::warn!(session_id = %session_id, error = %e, "peer close failed");
            }
        }
    }

    pub fn has_peer(&self, session_id: &str) -> bool {
        self.peers.lock().contains_key(session_id)
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn build_peer(
        &self,
        session_id: &str,
        hooks: InboundHooks,
    ) -> anyhow::Result<(Arc<RTCPeerConnection>, Arc<WebRtcTrackWriter>)> {
        let ice_servers: Vec<RTCIceServer> = self
            .ice
            .ice_servers()
            .await
            .into_iter()
            .map(|entry| RTCIceServer {
                urls: entry.urls,
                username: entry.username.unwrap_or_default(),
                credential: entry.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers,
                    ..Default::default()
                })
                .await
                .map_err(|e| anyhow::anyhow!("peer connection failed: {e}"))?,
        );

        // Outbound track toward the caller.
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 1,
                sdp_fmtp_line: OPUS_FMTP.to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            "astra-voice".to_owned(),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| anyhow::anyhow!("failed to add outbound track: {e}"))?;
        let track_writer = WebRtcTrackWriter::new(track);

        // ICE state surface.
        {
            let event_bus = Arc::clone(&self.event_bus);
            let session_id = session_id.to_owned();
            pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let event_bus = Arc::clone(&event_bus);
                let session_id = session_id.clone();
                Box::pin(async move {
                    tracing::info!(session_id = %session_id, state = %state, "ICE state changed");
                    event_bus.publish(
                        Event::new(EventType::IceConnectionChanged, &session_id).with_data(
                            EventData::IceState {
                                state: state.to_string(),
                            },
                        ),
                    );
                })
            }));
        }

        // Inbound media.
        {
            let event_bus = Arc::clone(&self.event_bus);
            let recorder = Arc::clone(&self.recorder);
            let session_id = session_id.to_owned();
            let hooks = Arc::new(hooks);
            pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let event_bus = Arc::clone(&event_bus);
                let recorder = Arc::clone(&recorder);
                let session_id = session_id.clone();
                let hooks = Arc::clone(&hooks);
                Box::pin(async move {
                    tracing::info!(
                        session_id = %session_id,
                        kind = %track.kind(),
                        "inbound track subscribed"
                    );
                    event_bus.publish(Event::new(EventType::AudioTrackReady, &session_id));
                    forward_inbound_audio(track, session_id, hooks, recorder).await;
                })
            }));
        }

        self.peers
            .lock()
            .insert(session_id.to_owned(), Arc::clone(&pc));
        Ok((pc, track_writer))
    }
}

/// Read RTP from the caller, capture it for recording, decode Opus to PCM16
/// and forward through the gate. Runs until the track or peer closes, then
/// releases the session's recording reference.
async fn forward_inbound_audio(
    track: Arc<TrackRemote>,
    session_id: String,
    hooks: Arc<InboundHooks>,
    recorder: Arc<Recorder>,
) {
    // The decoder is allocated on first inbound audio, one per session.
    let mut decoder: Option<opus::Decoder> = None;
    // 120 ms is the longest Opus frame.
    let mut pcm = vec![0i16; (hooks.sample_rate as usize * 120) / 1000];
    let mut first = true;

    loop {
        let (packet, _) = match track.read_rtp().await {
            Ok(read) => read,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "inbound track ended");
                break;
            }
        };
        if packet.payload.is_empty() {
            continue;
        }
        if first {
            first = false;
            (hooks.on_first_audio)();
        }

        recorder.record(
            &session_id,
            AudioDirection::Inbound,
            packet.header.sequence_number,
            packet.header.timestamp,
            Bytes::copy_from_slice(&packet.payload),
        );

        if decoder.is_none() {
            match opus::Decoder::new(hooks.sample_rate, opus::Channels::Mono) {
                Ok(d) => {
                    tracing::debug!(
                        session_id = %session_id,
                        sample_rate = hooks.sample_rate,
                        "opus decoder allocated"
                    );
                    decoder = Some(d);
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "opus decoder init failed");
                    break;
                }
            }
        }
        let Some(decoder) = decoder.as_mut() else { break };

        let samples = match decoder.decode(&packet.payload, &mut pcm, false) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "opus decode error");
                continue;
            }
        };

        if !(hooks.gate)() {
            continue;
        }
        let mut bytes = Vec::with_capacity(samples * 2);
        for sample in &pcm[..samples] {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        (hooks.sink)(bytes);
    }

    recorder.release(&session_id);
}

/// Rewrite the Opus fmtp line of a local description so every answer and
/// offer advertises the same 20 ms mono profile.
pub fn force_opus_params(sdp: &str) -> String {
    // Find the opus payload type from its rtpmap.
    let mut opus_pt: Option<&str> = None;
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            if rest.to_ascii_lowercase().contains("opus/48000") {
                opus_pt = rest.split_whitespace().next();
                break;
            }
        }
    }
    let Some(pt) = opus_pt else {
        return sdp.to_owned();
    };

    let fmtp_prefix = format!("a=fmtp:{pt} ");
    let mut out = Vec::new();
    let mut replaced = false;
    for line in sdp.lines() {
        if line.starts_with(&fmtp_prefix) {
            out.push(format!("{fmtp_prefix}{OPUS_FMTP}"));
            replaced = true;
        } else {
            out.push(line.to_owned());
            // No fmtp line present: add ours right after the rtpmap.
            if !replaced && line.starts_with(&format!("a=rtpmap:{pt} ")) {
                out.push(format!("{fmtp_prefix}{OPUS_FMTP}"));
                replaced = true;
            }
        }
    }
    let mut joined = out.join("\r\n");
    if sdp.ends_with('\n') {
        joined.push_str("\r\n");
    }
    joined
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SDP_WITH_FMTP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=fmtp:111 minptime=10;useinbandfec=1\r\n\
        a=sendrecv\r\n";

    const SDP_WITHOUT_FMTP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=rtpmap:96 opus/48000/2\r\n\
        a=sendrecv\r\n";

    #[test]
    fn fmtp_line_is_rewritten() {
        let munged = force_opus_params(SDP_WITH_FMTP);
        assert!(munged.contains("a=fmtp:111 minptime=20;useinbandfec=1;usedtx=0"));
        assert!(!munged.contains("minptime=10"));
    }

    #[test]
    fn fmtp_line_is_inserted_when_missing() {
        let munged = force_opus_params(SDP_WITHOUT_FMTP);
        let lines: Vec<&str> = munged.lines().collect();
        let rtpmap = lines.iter().position(|l| l.starts_with("a=rtpmap:96")).unwrap();
        assert_eq!(lines[rtpmap + 1], "a=fmtp:96 minptime=20;useinbandfec=1;usedtx=0");
    }

    #[test]
    fn sdp_without_opus_is_untouched() {
        let sdp = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 100\r\na=rtpmap:100 VP8/90000\r\n";
        assert_eq!(force_opus_params(sdp), sdp);
    }

    #[tokio::test]
    async fn processor_builds_and_cleanup_is_idempotent() {
        let ice = Arc::new(IceProvider::new(&crate::config::IceConfig {
            stun_servers: vec!["stun:stun.l.google.com:19302".into()],
            twilio_account_sid: None,
            twilio_auth_token: None,
        }));
        let bus = Arc::new(EventBus::new());
        let recorder = Arc::new(Recorder::disabled());
        let processor = WebRtcProcessor::new(ice, bus, recorder).unwrap();

        assert!(!processor.has_peer("s1"));
        processor.cleanup("s1").await;
        processor.cleanup("s1").await;
    }

    #[tokio::test]
    async fn answer_for_malformed_offer_fails() {
        let ice = Arc::new(IceProvider::new(&crate::config::IceConfig {
            stun_servers: vec![],
            twilio_account_sid: None,
            twilio_auth_token: None,
        }));
        let bus = Arc::new(EventBus::new());
        let recorder = Arc::new(Recorder::disabled());
        let processor = WebRtcProcessor::new(ice, bus, recorder).unwrap();

        let hooks = InboundHooks {
            gate: Arc::new(|| true),
            sink: Arc::new(|_| {}),
            sample_rate: 24_000,
            on_first_audio: Arc::new(|| {}),
        };
        let err = processor
            .process_sdp_offer("s1", "this is not sdp", hooks)
            .await
            .unwrap_err();
        let message = err.to_string().to_lowercase();
        assert!(message.contains("sdp") || message.contains("description"));
    }
}
