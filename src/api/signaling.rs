//! WebRTC signaling: SDP offer/answer exchange and stream lifecycle
//! endpoints. An accepted offer binds an authenticated `(user, shop)` pair
//! to a fresh stream id, attaches the processing pipeline to the inbound
//! video track, and registers the peer connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::track::track_remote::TrackRemote;

use super::AppState;
use crate::ai::tracker::TrackerConfig;
use crate::db::models::Shop;
use crate::error::Error;
use crate::media::{FrameDecoder, VideoCodec};
use crate::security::Claims;
use crate::streams::{ProcessorContext, StreamHandle, StreamProcessor, StreamStats};

#[derive(Debug, Deserialize)]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub user_id: Uuid,
    pub shop_id: Uuid,
    #[serde(default)]
    pub stream_metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct AnswerResponse {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub user_id: Uuid,
    pub stream_id: Uuid,
}

/// `POST /offer`
pub async fn handle_offer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(offer): Json<OfferRequest>,
) -> Result<Json<AnswerResponse>, Error> {
    let claims = authenticate(&state, &headers)?;
    if claims.sub != offer.user_id {
        return Err(Error::Forbidden(
            "user id in request does not match authenticated user".to_string(),
        ));
    }
    let shop = state.shops.verify_access(offer.shop_id, &claims).await?;

    if offer.sdp_type != "offer" {
        return Err(Error::BadRequest(format!(
            "expected type 'offer', got '{}'",
            offer.sdp_type
        )));
    }

    let stream_id = Uuid::new_v4();
    info!(
        "[{}/{}] received offer (shop {})",
        offer.user_id, stream_id, offer.shop_id
    );

    let deadline = Duration::from_secs(state.config.webrtc.offer_timeout_secs);
    match tokio::time::timeout(
        deadline,
        establish_stream(state.clone(), offer, shop, stream_id),
    )
    .await
    {
        Ok(result) => result.map(Json),
        Err(_) => {
            // Release whatever got registered before the deadline hit.
            if state.registry.teardown(stream_id).await.is_ok() {
                warn!("[{}] stream torn down after offer timeout", stream_id);
            }
            Err(Error::Timeout("offer handling deadline exceeded".to_string()))
        }
    }
}

async fn establish_stream(
    state: AppState,
    offer: OfferRequest,
    shop: Shop,
    stream_id: Uuid,
) -> Result<AnswerResponse, Error> {
    let user_id = offer.user_id;
    let pc = create_peer_connection(&state).await?;

    match negotiate(&state, &pc, &offer, &shop, stream_id).await {
        Ok(answer_sdp) => {
            info!("[{}/{}] stream registered", user_id, stream_id);
            Ok(AnswerResponse {
                sdp: answer_sdp,
                sdp_type: "answer".to_string(),
                user_id,
                stream_id,
            })
        }
        Err(e) => {
            // No stream must survive a failed offer.
            let _ = state.registry.remove(stream_id).await;
            if let Err(close_err) = pc.close().await {
                warn!(
                    "[{}/{}] error closing failed peer connection: {}",
                    user_id, stream_id, close_err
                );
            }
            Err(e)
        }
    }
}

async fn create_peer_connection(state: &AppState) -> Result<Arc<RTCPeerConnection>, Error> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| Error::Transport(format!("register codecs: {}", e)))?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| Error::Transport(format!("register interceptors: {}", e)))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: state.config.webrtc.stun_servers.clone(),
            ..Default::default()
        }],
        ..Default::default()
    };

    let pc = api
        .new_peer_connection(rtc_config)
        .await
        .map_err(|e| Error::Transport(format!("create peer connection: {}", e)))?;
    Ok(Arc::new(pc))
}

async fn negotiate(
    state: &AppState,
    pc: &Arc<RTCPeerConnection>,
    offer: &OfferRequest,
    shop: &Shop,
    stream_id: Uuid,
) -> Result<String, Error> {
    let user_id = offer.user_id;
    let location = location_from_metadata(offer.stream_metadata.as_ref(), stream_id);
    let stats = Arc::new(StreamStats::default());

    attach_track_handler(state, pc, shop, stream_id, user_id, &location, &stats);
    attach_state_handler(state, pc, stream_id, user_id);

    let remote = RTCSessionDescription::offer(offer.sdp.clone())
        .map_err(|e| Error::BadRequest(format!("invalid offer sdp: {}", e)))?;
    pc.set_remote_description(remote)
        .await
        .map_err(|e| Error::BadRequest(format!("set remote description: {}", e)))?;

    let answer = pc
        .create_answer(None)
        .await
        .map_err(|e| Error::Transport(format!("create answer: {}", e)))?;

    // Non-trickle: wait for ICE gathering so the answer carries candidates.
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .map_err(|e| Error::Transport(format!("set local description: {}", e)))?;
    let _ = gather_complete.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| Error::Internal("local description missing".to_string()))?;

    state
        .registry
        .add(Arc::new(StreamHandle {
            stream_id,
            user_id,
            shop_id: shop.id,
            location,
            created_at: Utc::now(),
            pc: Arc::clone(pc),
            stats,
        }))
        .await?;

    Ok(local.sdp)
}

/// Attach the processing pipeline to the inbound video track: decoder,
/// processor task, and RTP reader task.
fn attach_track_handler(
    state: &AppState,
    pc: &Arc<RTCPeerConnection>,
    shop: &Shop,
    stream_id: Uuid,
    user_id: Uuid,
    location: &str,
    stats: &Arc<StreamStats>,
) {
    let state = state.clone();
    let external_target = shop.telegram_chat_id.clone();
    let shop_id = shop.id;
    let location = location.to_string();
    let stats = Arc::clone(stats);

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let state = state.clone();
        let external_target = external_target.clone();
        let location = location.clone();
        let stats = Arc::clone(&stats);

        Box::pin(async move {
            let mime = track.codec().capability.mime_type.clone();
            if !mime.to_ascii_lowercase().starts_with("video/") {
                debug!("[{}/{}] ignoring non-video track {}", user_id, stream_id, mime);
                return;
            }
            let Some(codec) = VideoCodec::from_mime(&mime) else {
                warn!(
                    "[{}/{}] unsupported video codec {}, track ignored",
                    user_id, stream_id, mime
                );
                return;
            };
            info!("[{}/{}] video track received ({})", user_id, stream_id, mime);

            let (frame_tx, frame_rx) = watch::channel(None);
            let decoder = match FrameDecoder::new(codec, frame_tx) {
                Ok(decoder) => decoder,
                Err(e) => {
                    error!("[{}/{}] decoder setup failed: {}", user_id, stream_id, e);
                    return;
                }
            };

            let detection = &state.config.detection;
            let processor = StreamProcessor::new(
                ProcessorContext {
                    stream_id,
                    user_id,
                    shop_id,
                    location,
                    external_target,
                    models: Arc::clone(&state.models),
                    hub: Arc::clone(&state.hub),
                    recorder: Arc::clone(&state.recorder),
                    stats,
                },
                TrackerConfig {
                    iou_threshold: detection.tracker_iou_threshold,
                    max_age: detection.tracker_max_age,
                    min_confidence: detection.person_confidence,
                },
            );
            tokio::spawn(processor.run(frame_rx));
            tokio::spawn(read_track(track, decoder, codec, user_id, stream_id));
        })
    }));
}

/// How long a `disconnected` connection may linger before teardown.
const DISCONNECT_GRACE: Duration = Duration::from_secs(10);

/// Deregister on terminal peer-connection states. `disconnected` gets a
/// grace period since ICE can recover from it.
fn attach_state_handler(
    state: &AppState,
    pc: &Arc<RTCPeerConnection>,
    stream_id: Uuid,
    user_id: Uuid,
) {
    let registry = Arc::clone(&state.registry);

    pc.on_peer_connection_state_change(Box::new(move |connection_state| {
        let registry = Arc::clone(&registry);

        Box::pin(async move {
            info!(
                "[{}/{}] connection state: {}",
                user_id, stream_id, connection_state
            );
            match connection_state {
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    if registry.teardown(stream_id).await.is_ok() {
                        info!("[{}/{}] stream cleaned up", user_id, stream_id);
                    }
                }
                RTCPeerConnectionState::Disconnected => {
                    tokio::spawn(async move {
                        tokio::time::sleep(DISCONNECT_GRACE).await;
                        let still_disconnected = registry
                            .get(stream_id)
                            .await
                            .map(|handle| {
                                handle.pc.connection_state()
                                    == RTCPeerConnectionState::Disconnected
                            })
                            .unwrap_or(false);
                        if still_disconnected && registry.teardown(stream_id).await.is_ok() {
                            info!(
                                "[{}/{}] stream did not recover, cleaned up",
                                user_id, stream_id
                            );
                        }
                    });
                }
                _ => {}
            }
        })
    }));
}

/// Pull RTP from the track, depacketize, and feed the decoder until the
/// track or the decoder ends.
async fn read_track(
    track: Arc<TrackRemote>,
    decoder: FrameDecoder,
    codec: VideoCodec,
    user_id: Uuid,
    stream_id: Uuid,
) {
    let mut depacketizer: Box<dyn Depacketizer + Send> = match codec {
        VideoCodec::H264 => Box::new(H264Packet::default()),
        VideoCodec::Vp8 => Box::new(Vp8Packet::default()),
    };

    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) => {
                info!("[{}/{}] track ended: {}", user_id, stream_id, e);
                break;
            }
        };
        if packet.payload.is_empty() {
            continue;
        }

        match depacketizer.depacketize(&packet.payload) {
            Ok(payload) if !payload.is_empty() => {
                if let Err(e) = decoder.push(&payload) {
                    warn!("[{}/{}] decoder rejected payload: {}", user_id, stream_id, e);
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => debug!("[{}/{}] depacketize: {}", user_id, stream_id, e),
        }
    }

    decoder.close();
}

fn location_from_metadata(metadata: Option<&serde_json::Value>, stream_id: Uuid) -> String {
    metadata
        .and_then(|m| {
            m.get("location")
                .or_else(|| m.get("camera"))
                .or_else(|| m.get("camera_id"))
        })
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("Stream {}", &stream_id.to_string()[..8]))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Claims, Error> {
    state
        .auth
        .verify_bearer(headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()))
}

/// `GET /users/{user_id}/streams`
pub async fn list_user_streams(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, Error> {
    let claims = authenticate(&state, &headers)?;
    if claims.sub != user_id {
        return Err(Error::Forbidden("not your streams".to_string()));
    }

    let streams = state.registry.list(user_id).await;
    Ok(Json(json!({
        "user_id": user_id,
        "stream_count": streams.len(),
        "streams": streams,
    })))
}

/// `DELETE /users/{user_id}/streams/{stream_id}`
pub async fn close_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((user_id, stream_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, Error> {
    let claims = authenticate(&state, &headers)?;
    if claims.sub != user_id {
        return Err(Error::Forbidden("not your stream".to_string()));
    }

    match state.registry.get(stream_id).await {
        Some(handle) if handle.user_id == user_id => {}
        _ => {
            return Err(Error::NotFound(format!(
                "stream {} not found for user {}",
                stream_id, user_id
            )))
        }
    }

    state.registry.teardown(stream_id).await?;
    let remaining = state.registry.list(user_id).await.len();
    Ok(Json(json!({
        "status": "success",
        "user_id": user_id,
        "stream_id": stream_id,
        "remaining_streams": remaining,
    })))
}

/// `DELETE /users/{user_id}`
pub async fn close_user_streams(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, Error> {
    let claims = authenticate(&state, &headers)?;
    if claims.sub != user_id {
        return Err(Error::Forbidden("not your streams".to_string()));
    }

    let closed = state.registry.teardown_user(user_id).await;
    if closed == 0 {
        return Err(Error::NotFound(format!("no streams for user {}", user_id)));
    }
    Ok(Json(json!({
        "status": "success",
        "user_id": user_id,
        "streams_closed": closed,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_prefers_explicit_metadata() {
        let stream_id = Uuid::new_v4();
        let meta = json!({"location": "Entrance", "camera": "cam-1"});
        assert_eq!(location_from_metadata(Some(&meta), stream_id), "Entrance");

        let camera_only = json!({"camera": "cam-1"});
        assert_eq!(location_from_metadata(Some(&camera_only), stream_id), "cam-1");
    }

    #[test]
    fn location_falls_back_to_stream_id_prefix() {
        let stream_id = Uuid::new_v4();
        let fallback = location_from_metadata(None, stream_id);
        assert!(fallback.starts_with("Stream "));
        assert!(fallback.contains(&stream_id.to_string()[..8]));
    }

    #[test]
    fn offer_request_parses_wire_shape() {
        let raw = json!({
            "sdp": "v=0...",
            "type": "offer",
            "user_id": "550e8400-e29b-41d4-a716-446655440000",
            "shop_id": "650e8400-e29b-41d4-a716-446655440000",
            "stream_metadata": {"location": "Entrance"}
        });
        let offer: OfferRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(offer.sdp_type, "offer");
        assert!(offer.stream_metadata.is_some());
    }
}
