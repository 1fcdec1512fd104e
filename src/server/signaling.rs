//! WebRTC session negotiation.
//!
//! Viewers send a single SDP offer over the signaling WebSocket and get back
//! a complete answer with every ICE candidate already embedded. Frames flow
//! as JPEG messages over the `frames` data channel the browser creates.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::frame::{FrameSlot, PipelineSlots};

use super::session::{encode_jpeg, FeedKind, PacingSettings, Publisher, SessionSet};

pub const FRAMES_CHANNEL: &str = "frames";

/// Inbound signaling message. Anything but an offer is ignored.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer { sdp: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalReply {
    Answer { sdp: String },
}

impl SignalReply {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize signaling reply")
    }
}

/// `None` for malformed JSON or an offer without `sdp`.
pub fn parse_signal(text: &str) -> Option<SignalMessage> {
    serde_json::from_str(text).ok()
}

type PeerSet = SessionSet<Arc<RTCPeerConnection>>;
type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct FeedHub {
    sessions: Arc<PeerSet>,
    slot: Arc<FrameSlot>,
}

impl FeedHub {
    fn new(feed: FeedKind, slot: Arc<FrameSlot>) -> Self {
        Self {
            sessions: Arc::new(SessionSet::new(feed)),
            slot,
        }
    }
}

pub struct SessionManager {
    api: API,
    ice_servers: Vec<String>,
    ai: FeedHub,
    clean: FeedHub,
    width: u32,
    height: u32,
    pacing: PacingSettings,
}

impl SessionManager {
    pub fn new(
        ice_servers: Vec<String>,
        slots: &PipelineSlots,
        width: u32,
        height: u32,
        pacing: PacingSettings,
    ) -> Self {
        Self {
            api: APIBuilder::new().build(),
            ice_servers,
            ai: FeedHub::new(FeedKind::Ai, slots.ai.clone()),
            clean: FeedHub::new(FeedKind::Clean, slots.clean.clone()),
            width,
            height,
            pacing,
        }
    }

    fn hub(&self, feed: FeedKind) -> &FeedHub {
        match feed {
            FeedKind::Ai => &self.ai,
            FeedKind::Clean => &self.clean,
        }
    }

    pub fn client_count(&self, feed: FeedKind) -> usize {
        self.hub(feed).sessions.len()
    }

    /// Answer `offer_sdp` with a new session on `feed`. Returns the session
    /// id and the answer SDP.
    pub async fn negotiate(&self, feed: FeedKind, offer_sdp: String) -> Result<(u64, String)> {
        let hub = self.hub(feed);
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .context("create peer connection")?,
        );
        let id = hub.sessions.insert(pc.clone());
        self.wire(feed, id, &pc);

        match answer(&pc, offer_sdp).await {
            Ok(sdp) => {
                log::info!(
                    "{} session {} negotiated ({} connected)",
                    feed.as_str(),
                    id,
                    hub.sessions.len()
                );
                Ok((id, sdp))
            }
            Err(err) => {
                hub.sessions.remove(id);
                if let Err(close_err) = pc.close().await {
                    log::warn!("close failed session {}: {}", id, close_err);
                }
                Err(err)
            }
        }
    }

    fn wire(&self, feed: FeedKind, id: u64, pc: &RTCPeerConnection) {
        let hub = self.hub(feed);

        let sessions = hub.sessions.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            log::debug!("{} session {}: {}", feed.as_str(), id, state);
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                if let Some(pc) = sessions.remove(id) {
                    log::info!("{} session {} ended ({})", feed.as_str(), id, state);
                    if state == RTCPeerConnectionState::Failed {
                        tokio::spawn(async move {
                            if let Err(err) = pc.close().await {
                                log::warn!("close session {}: {}", id, err);
                            }
                        });
                    }
                }
            }
            Box::pin(async {})
        }));

        let sessions = hub.sessions.clone();
        let slot = hub.slot.clone();
        let (width, height, pacing) = (self.width, self.height, self.pacing);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| -> HandlerFuture {
            if dc.label() != FRAMES_CHANNEL {
                log::debug!("ignoring data channel '{}' on session {}", dc.label(), id);
                return Box::pin(async {});
            }
            let publisher = Publisher::new(feed, slot.clone(), width, height);
            let sessions = sessions.clone();
            Box::pin(async move {
                let channel = dc.clone();
                dc.on_open(Box::new(move || {
                    tokio::spawn(pump(publisher, channel, pacing, sessions, id));
                    Box::pin(async {})
                }));
            })
        }));
    }

    /// Close every session on the signaling socket that owned `ids`.
    pub async fn close_sessions(&self, feed: FeedKind, ids: &[u64]) {
        for &id in ids {
            if let Some(pc) = self.hub(feed).sessions.remove(id) {
                if let Err(err) = pc.close().await {
                    log::warn!("close session {}: {}", id, err);
                }
            }
        }
    }

    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for hub in [&self.ai, &self.clean] {
            for pc in hub.sessions.drain() {
                if let Err(err) = pc.close().await {
                    log::warn!("close {} session: {}", hub.sessions.feed().as_str(), err);
                }
                closed += 1;
            }
        }
        closed
    }
}

async fn answer(pc: &RTCPeerConnection, offer_sdp: String) -> Result<String> {
    let offer = RTCSessionDescription::offer(offer_sdp).context("parse SDP offer")?;
    pc.set_remote_description(offer)
        .await
        .context("set remote description")?;
    let answer = pc.create_answer(None).await.context("create answer")?;
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .context("set local description")?;
    let _ = gathered.recv().await;
    let local = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow!("no local description after ICE gathering"))?;
    Ok(local.sdp)
}

/// Per-session transport clock.
async fn pump(
    mut publisher: Publisher,
    dc: Arc<RTCDataChannel>,
    pacing: PacingSettings,
    sessions: Arc<PeerSet>,
    id: u64,
) {
    let feed = publisher.feed();
    let quality = pacing.jpeg_quality;
    let mut ticker = tokio::time::interval(pacing.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sent: u64 = 0;

    loop {
        ticker.tick().await;
        if !sessions.contains(id) || dc.ready_state() != RTCDataChannelState::Open {
            break;
        }

        let encoded = tokio::task::spawn_blocking(move || {
            let frame = publisher.tick();
            let jpeg = encode_jpeg(frame.image(), quality);
            (publisher, jpeg)
        })
        .await;
        let jpeg = match encoded {
            Ok((returned, jpeg)) => {
                publisher = returned;
                jpeg
            }
            Err(err) => {
                log::error!("{} session {}: encoder task failed: {}", feed.as_str(), id, err);
                break;
            }
        };

        match jpeg {
            Ok(bytes) => {
                if let Err(err) = dc.send(&Bytes::from(bytes)).await {
                    log::debug!("{} session {}: send failed: {}", feed.as_str(), id, err);
                    break;
                }
                sent += 1;
            }
            Err(err) => log::warn!("{} session {}: {:#}", feed.as_str(), id, err),
        }
    }
    log::debug!("{} session {}: pump stopped after {} frames", feed.as_str(), id, sent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_offer() {
        assert_eq!(
            parse_signal(r#"{"type":"offer","sdp":"v=0\r\n"}"#),
            Some(SignalMessage::Offer {
                sdp: "v=0\r\n".to_string()
            })
        );
    }

    #[test]
    fn unknown_types_and_garbage_are_not_offers() {
        assert_eq!(
            parse_signal(r#"{"type":"candidate","candidate":{}}"#),
            Some(SignalMessage::Other)
        );
        assert_eq!(parse_signal(r#"{"type":"offer"}"#), None);
        assert_eq!(parse_signal("not json"), None);
        assert_eq!(parse_signal(r#"{"sdp":"v=0"}"#), None);
    }

    #[test]
    fn answer_reply_shape() -> Result<()> {
        let reply = SignalReply::Answer {
            sdp: "v=0".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&reply.to_json()?)?;
        assert_eq!(value["type"], "answer");
        assert_eq!(value["sdp"], "v=0");
        Ok(())
    }

    #[tokio::test]
    async fn offer_registers_session_on_its_feed_only() -> Result<()> {
        let slots = PipelineSlots::new();
        let pacing = PacingSettings {
            fps: 30,
            jpeg_quality: 80,
        };
        let manager = SessionManager::new(Vec::new(), &slots, 64, 48, pacing);

        let viewer = APIBuilder::new()
            .build()
            .new_peer_connection(RTCConfiguration::default())
            .await?;
        viewer.create_data_channel(FRAMES_CHANNEL, None).await?;
        let offer = viewer.create_offer(None).await?;
        let mut gathered = viewer.gathering_complete_promise().await;
        viewer.set_local_description(offer).await?;
        let _ = gathered.recv().await;
        let offer_sdp = viewer
            .local_description()
            .await
            .ok_or_else(|| anyhow!("viewer has no offer"))?
            .sdp;

        let (id, answer_sdp) = manager.negotiate(FeedKind::Clean, offer_sdp).await?;
        assert!(answer_sdp.starts_with("v=0"));
        assert_eq!(manager.client_count(FeedKind::Clean), 1);
        assert_eq!(manager.client_count(FeedKind::Ai), 0);

        manager.close_sessions(FeedKind::Clean, &[id]).await;
        assert_eq!(manager.client_count(FeedKind::Clean), 0);
        assert_eq!(manager.close_all().await, 0);
        viewer.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn bad_offer_leaves_no_session() {
        let slots = PipelineSlots::new();
        let pacing = PacingSettings {
            fps: 30,
            jpeg_quality: 80,
        };
        let manager = SessionManager::new(Vec::new(), &slots, 64, 48, pacing);
        assert!(manager
            .negotiate(FeedKind::Ai, "garbage".to_string())
            .await
            .is_err());
        assert_eq!(manager.client_count(FeedKind::Ai), 0);
    }
}
