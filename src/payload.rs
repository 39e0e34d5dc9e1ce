use crate::types::{AppId,
                   MediaSessionId,
                   MessageType, MessageTypeConst,
                   NamespaceConst};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::{
    fmt::{self, Debug, Display},
    sync::atomic::{AtomicI32, Ordering},
};

/// i32 that represents a request_id in the cast protocol.
///
/// Zero is only used in broadcast responses with no corresponding request.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct RequestId(i32);

pub(crate) struct RequestIdGen(AtomicI32);

impl RequestId {
    pub const BROADCAST: RequestId = RequestId(Self::BROADCAST_I32);
    const BROADCAST_I32: i32 = 0;
}

impl RequestIdGen {
    /// Some broadcasts have `request_id` 0, so skip that.
    const INITIAL_I32: i32 = RequestId::BROADCAST_I32 + 1;
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload<T>
{
    pub request_id: Option<RequestId>,

    #[serde(rename = "type")]
    pub typ: MessageType,

    #[serde(flatten)]
    pub inner: T,
}

pub type PayloadDyn = Payload<serde_json::Value>;

pub trait RequestInner: Debug + Serialize
{
    const CHANNEL_NAMESPACE: NamespaceConst;
    const TYPE_NAME: MessageTypeConst;
}

pub trait ResponseInner: Debug + DeserializeOwned
{
    const CHANNEL_NAMESPACE: NamespaceConst;
    const TYPE_NAMES: &'static [MessageTypeConst];
}

pub const USER_AGENT: &str = concat!("castfile/", env!("CARGO_PKG_VERSION"));


impl RequestId {
    pub fn inner(self) -> i32 {
        self.0
    }

    fn rpc_id_from(n: i32) -> RequestId {
        let id = RequestId(n);

        if id.is_broadcast() {
            panic!("RequestId::rpc_id_from: was broadcast = {id}");
        }

        id
    }

    pub fn is_broadcast(self) -> bool {
        self == RequestId::BROADCAST
    }
}

impl From<RequestId> for i32 {
    fn from(id: RequestId) -> i32 {
        id.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl RequestIdGen {
    pub(crate) fn new() -> RequestIdGen {
        RequestIdGen(AtomicI32::new(Self::INITIAL_I32))
    }

    pub(crate) fn take_next(&self) -> RequestId {
        loop {
            let id = self.0.fetch_add(1, Ordering::SeqCst);
            if id == RequestId::BROADCAST_I32 {
                // Receivers use 0 for broadcast messages, take the next value.
                continue;
            }

            return RequestId::rpc_id_from(id);
        }
    }
}

pub mod connection {
    use super::*;

    pub const CHANNEL_NAMESPACE: NamespaceConst = "urn:x-cast:com.google.cast.tp.connection";

    pub const MESSAGE_TYPE_CONNECT: MessageTypeConst = "CONNECT";
    pub const MESSAGE_TYPE_CLOSE: MessageTypeConst = "CLOSE";

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ConnectRequest {
        pub user_agent: String,
    }

    impl RequestInner for ConnectRequest {
        const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
        const TYPE_NAME: MessageTypeConst = MESSAGE_TYPE_CONNECT;
    }
}

pub mod heartbeat {
    use super::*;

    pub const CHANNEL_NAMESPACE: NamespaceConst = "urn:x-cast:com.google.cast.tp.heartbeat";

    pub const MESSAGE_TYPE_PING: MessageTypeConst = "PING";
    pub const MESSAGE_TYPE_PONG: MessageTypeConst = "PONG";

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Ping {}

    impl RequestInner for Ping {
        const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
        const TYPE_NAME: MessageTypeConst = MESSAGE_TYPE_PING;
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Pong {}

    impl RequestInner for Pong {
        const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
        const TYPE_NAME: MessageTypeConst = MESSAGE_TYPE_PONG;
    }
}

pub mod media {
    use super::*;
    use super::receiver::AppSessionId;

    pub const CHANNEL_NAMESPACE: NamespaceConst = "urn:x-cast:com.google.cast.media";

    pub const MESSAGE_REQUEST_TYPE_GET_STATUS: MessageTypeConst = "GET_STATUS";
    pub const MESSAGE_REQUEST_TYPE_LOAD: MessageTypeConst = "LOAD";
    pub const MESSAGE_REQUEST_TYPE_PLAY: MessageTypeConst = "PLAY";
    pub const MESSAGE_REQUEST_TYPE_PAUSE: MessageTypeConst = "PAUSE";
    pub const MESSAGE_REQUEST_TYPE_STOP: MessageTypeConst = "STOP";

    pub const MESSAGE_RESPONSE_TYPE_MEDIA_STATUS: MessageTypeConst = "MEDIA_STATUS";
    pub const MESSAGE_RESPONSE_TYPE_LOAD_CANCELLED: MessageTypeConst = "LOAD_CANCELLED";
    pub const MESSAGE_RESPONSE_TYPE_LOAD_FAILED: MessageTypeConst = "LOAD_FAILED";
    pub const MESSAGE_RESPONSE_TYPE_INVALID_PLAYER_STATE: MessageTypeConst
        = "INVALID_PLAYER_STATE";
    pub const MESSAGE_RESPONSE_TYPE_INVALID_REQUEST: MessageTypeConst = "INVALID_REQUEST";

    pub type TrackId = i32;

    /// Reported player state of the remote media session.
    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum PlayerState {
        Idle,
        Buffering,
        Loading,
        Playing,
        Paused,

        #[serde(other)]
        Unknown,
    }

    /// Why an `Idle` player state was entered.
    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum IdleReason {
        Cancelled,
        Interrupted,
        Finished,
        Error,

        #[serde(other)]
        Unknown,
    }

    impl Display for PlayerState {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            let s = match self {
                PlayerState::Idle => "IDLE",
                PlayerState::Buffering => "BUFFERING",
                PlayerState::Loading => "LOADING",
                PlayerState::Playing => "PLAYING",
                PlayerState::Paused => "PAUSED",
                PlayerState::Unknown => "UNKNOWN",
            };
            f.write_str(s)
        }
    }

    #[derive(Clone, Debug, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Status {
        #[serde(rename = "status")]
        pub entries: Vec<StatusEntry>,
    }

    impl Status {
        pub fn try_find_media_session_id(&self) -> crate::Result<MediaSessionId> {
            self.entries.first()
                .map(|entry| entry.media_session_id)
                .ok_or_else(|| anyhow::format_err!(
                    "media status has no entries, so no media session id").into())
        }
    }

    #[derive(Clone, Debug, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct StatusEntry {
        pub media_session_id: MediaSessionId,

        pub media: Option<Media>,

        pub playback_rate: f32,
        pub player_state: PlayerState,
        pub idle_reason: Option<IdleReason>,
        pub current_time: Option<f64>,
        pub supported_media_commands: u32,
    }

    #[skip_serializing_none]
    #[derive(Clone, Debug, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Media {
        pub content_id: String,

        #[serde(default)]
        pub stream_type: String,

        pub content_type: String,

        pub metadata: Option<Metadata>,

        pub duration: Option<f64>,

        pub tracks: Option<Vec<Track>>,
    }

    #[skip_serializing_none]
    #[derive(Clone, Debug, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Metadata {
        pub metadata_type: u32,
        pub title: Option<String>,
        pub subtitle: Option<String>,
    }

    /// A side-loaded track, e.g. a subtitle file the device fetches itself.
    #[skip_serializing_none]
    #[derive(Clone, Debug, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Track {
        pub track_id: TrackId,

        #[serde(rename = "type")]
        pub track_type: String,

        pub track_content_id: Option<String>,
        pub track_content_type: Option<String>,
        pub subtype: Option<String>,
        pub name: Option<String>,
        pub language: Option<String>,
    }

    pub const TRACK_TYPE_TEXT: &str = "TEXT";
    pub const TRACK_SUBTYPE_SUBTITLES: &str = "SUBTITLES";

    pub const STREAM_TYPE_BUFFERED: &str = "BUFFERED";

    impl Track {
        /// Subtitle track referencing a URL the device dereferences itself.
        pub fn subtitles(track_id: TrackId, url: String, content_type: String) -> Track {
            Track {
                track_id,
                track_type: TRACK_TYPE_TEXT.to_string(),
                track_content_id: Some(url),
                track_content_type: Some(content_type),
                subtype: Some(TRACK_SUBTYPE_SUBTITLES.to_string()),
                name: None,
                language: None,
            }
        }
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MediaRequestCommon {
        pub media_session_id: MediaSessionId,
    }

    #[skip_serializing_none]
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct LoadRequest {
        pub session_id: AppSessionId,

        pub media: Media,
        pub current_time: f64,

        pub autoplay: bool,
        pub preload_time: f64,

        pub active_track_ids: Option<Vec<TrackId>>,
    }

    impl RequestInner for LoadRequest {
        const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
        const TYPE_NAME: MessageTypeConst = MESSAGE_REQUEST_TYPE_LOAD;
    }

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type",
            rename_all = "camelCase")]
    pub enum LoadResponse {
        #[serde(rename = "MEDIA_STATUS")]
        Ok(Status),

        #[serde(rename = "LOAD_CANCELLED")]
        LoadCancelled,

        #[serde(rename = "LOAD_FAILED")]
        LoadFailed,

        #[serde(rename = "INVALID_PLAYER_STATE")]
        InvalidPlayerState,

        #[serde(rename = "INVALID_REQUEST")]
        InvalidRequest { reason: String },
    }

    impl ResponseInner for LoadResponse {
        const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
        const TYPE_NAMES: &'static [MessageTypeConst] = &[
            MESSAGE_RESPONSE_TYPE_MEDIA_STATUS,
            MESSAGE_RESPONSE_TYPE_LOAD_CANCELLED,
            MESSAGE_RESPONSE_TYPE_LOAD_FAILED,
            MESSAGE_RESPONSE_TYPE_INVALID_PLAYER_STATE,
            MESSAGE_RESPONSE_TYPE_INVALID_REQUEST,
        ];
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GetStatusRequest {
        pub media_session_id: Option<MediaSessionId>,
    }

    impl RequestInner for GetStatusRequest {
        const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
        const TYPE_NAME: MessageTypeConst = MESSAGE_REQUEST_TYPE_GET_STATUS;
    }

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type",
            rename_all = "camelCase")]
    pub enum GetStatusResponse {
        #[serde(rename = "MEDIA_STATUS")]
        Ok(Status),

        #[serde(rename = "INVALID_PLAYER_STATE")]
        InvalidPlayerState,

        #[serde(rename = "INVALID_REQUEST")]
        InvalidRequest { reason: String },
    }

    impl ResponseInner for GetStatusResponse {
        const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
        const TYPE_NAMES: &'static [MessageTypeConst] = &[
            MESSAGE_RESPONSE_TYPE_MEDIA_STATUS,
            MESSAGE_RESPONSE_TYPE_INVALID_PLAYER_STATE,
            MESSAGE_RESPONSE_TYPE_INVALID_REQUEST,
        ];
    }

    macro_rules! simple_media_request {
        ($name: ident, $msg_type_name: path) => {
            #[derive(Debug, Serialize)]
            pub struct $name(pub MediaRequestCommon);

            impl RequestInner for $name {
                const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
                const TYPE_NAME: MessageTypeConst = $msg_type_name;
            }
        };
    }

    simple_media_request!(PlayRequest,  MESSAGE_REQUEST_TYPE_PLAY);
    simple_media_request!(PauseRequest, MESSAGE_REQUEST_TYPE_PAUSE);
    simple_media_request!(StopRequest,  MESSAGE_REQUEST_TYPE_STOP);
}

pub mod receiver {
    use super::*;
    use crate::types::{AppSession, EndpointId};
    use std::borrow::Cow;

    pub const CHANNEL_NAMESPACE: NamespaceConst = "urn:x-cast:com.google.cast.receiver";

    pub const MESSAGE_REQUEST_TYPE_LAUNCH: MessageTypeConst = "LAUNCH";
    pub const MESSAGE_REQUEST_TYPE_STOP: MessageTypeConst = "STOP";
    pub const MESSAGE_REQUEST_TYPE_GET_STATUS: MessageTypeConst = "GET_STATUS";

    pub const MESSAGE_RESPONSE_TYPE_RECEIVER_STATUS: MessageTypeConst = "RECEIVER_STATUS";
    pub const MESSAGE_RESPONSE_TYPE_LAUNCH_ERROR: MessageTypeConst = "LAUNCH_ERROR";
    pub const MESSAGE_RESPONSE_TYPE_INVALID_REQUEST: MessageTypeConst = "INVALID_REQUEST";

    pub type AppSessionId = String;

    #[derive(Clone, Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct StatusWrapper {
        pub status: Status,
    }

    #[derive(Clone, Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Status {
        #[serde(default)]
        pub applications: Vec<Application>,

        #[serde(default)]
        pub is_active_input: bool,

        #[serde(default)]
        pub is_stand_by: bool,

        pub volume: Volume,
    }

    #[derive(Clone, Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Application {
        pub app_id: AppId,
        pub session_id: AppSessionId,
        pub transport_id: EndpointId,

        #[serde(default)]
        pub namespaces: Vec<AppNamespace>,

        #[serde(default)]
        pub display_name: String,

        #[serde(default)]
        pub status_text: String,

        #[serde(default)]
        pub is_idle_screen: bool,
    }

    impl Application {
        pub fn has_namespace(&self, ns: &str) -> bool {
            self.namespaces.iter().any(|app_ns| app_ns == ns)
        }

        pub fn to_app_session(&self, receiver_destination_id: EndpointId) -> AppSession {
            AppSession {
                receiver_destination_id,
                app_destination_id: self.transport_id.clone(),
                app_session_id: self.session_id.clone(),
            }
        }
    }

    #[derive(Clone, Deserialize, Debug, Eq, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct AppNamespace {
        pub name: Cow<'static, str>,
    }

    impl From<&str> for AppNamespace {
        fn from(s: &str) -> AppNamespace {
            AppNamespace { name: s.to_string().into() }
        }
    }

    impl PartialEq<str> for AppNamespace {
        fn eq(&self, other: &str) -> bool {
            self.name == other
        }
    }

    /// Volume options of the cast device itself.
    #[derive(Clone, Debug, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Volume {
        pub level: Option<f32>,
        pub muted: Option<bool>,

        pub control_type: Option<String>,
        pub step_interval: Option<f32>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GetStatusRequest {}

    impl RequestInner for GetStatusRequest {
        const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
        const TYPE_NAME: MessageTypeConst = MESSAGE_REQUEST_TYPE_GET_STATUS;
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GetStatusResponse(pub StatusWrapper);

    impl ResponseInner for GetStatusResponse {
        const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
        const TYPE_NAMES: &'static [MessageTypeConst] = &[MESSAGE_RESPONSE_TYPE_RECEIVER_STATUS];
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct LaunchRequest {
        pub app_id: AppId,
    }

    impl RequestInner for LaunchRequest {
        const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
        const TYPE_NAME: MessageTypeConst = MESSAGE_REQUEST_TYPE_LAUNCH;
    }

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type",
            rename_all = "camelCase")]
    pub enum LaunchResponse {
        #[serde(rename = "RECEIVER_STATUS")]
        Ok(StatusWrapper),

        #[serde(rename = "LAUNCH_ERROR")]
        Error {
            reason: String,
        },

        #[serde(rename = "INVALID_REQUEST")]
        InvalidRequest {
            reason: String,
        },
    }

    impl ResponseInner for LaunchResponse {
        const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
        const TYPE_NAMES: &'static [MessageTypeConst] = &[
            MESSAGE_RESPONSE_TYPE_INVALID_REQUEST,
            MESSAGE_RESPONSE_TYPE_LAUNCH_ERROR,
            MESSAGE_RESPONSE_TYPE_RECEIVER_STATUS,
        ];
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct StopRequest {
        pub session_id: AppSessionId,
    }

    impl RequestInner for StopRequest {
        const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
        const TYPE_NAME: MessageTypeConst = MESSAGE_REQUEST_TYPE_STOP;
    }

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type",
            rename_all = "camelCase")]
    pub enum StopResponse {
        #[serde(rename = "RECEIVER_STATUS")]
        Ok(StatusWrapper),

        #[serde(rename = "INVALID_REQUEST")]
        InvalidRequest {
            reason: String,
        },
    }

    impl ResponseInner for StopResponse {
        const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
        const TYPE_NAMES: &'static [MessageTypeConst] = &[
            MESSAGE_RESPONSE_TYPE_RECEIVER_STATUS,
            MESSAGE_RESPONSE_TYPE_INVALID_REQUEST,
        ];
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_id_gen_default() {
        let gen = RequestIdGen::new();
        assert_eq!(gen.take_next().0, 1);
        assert_eq!(gen.take_next().0, 2);
        assert_eq!(gen.take_next().0, 3);
    }

    #[test]
    fn request_id_gen_overflow() {
        let gen = RequestIdGen(AtomicI32::new(i32::MAX - 1));
        assert_eq!(gen.take_next().0, i32::MAX - 1);
        assert_eq!(gen.take_next().0, i32::MAX);
        assert_eq!(gen.take_next().0, i32::MIN);
        assert_eq!(gen.take_next().0, i32::MIN + 1);
    }

    #[test]
    fn request_id_gen_skip_0() {
        let gen = RequestIdGen(AtomicI32::new(-1));
        assert_eq!(gen.take_next().0, -1);
        assert_eq!(gen.take_next().0,  1);
        assert_eq!(gen.take_next().0,  2);
    }

    #[test]
    fn load_request_json_shape() {
        let req = media::LoadRequest {
            session_id: "A1B2".to_string(),
            media: media::Media {
                content_id: "http://192.168.1.2:44301/video".to_string(),
                stream_type: media::STREAM_TYPE_BUFFERED.to_string(),
                content_type: "video/mp4".to_string(),
                metadata: None,
                duration: None,
                tracks: Some(vec![media::Track::subtitles(
                    1,
                    "http://192.168.1.2:44301/subtitles".to_string(),
                    "text/vtt".to_string())]),
            },
            current_time: 0.0,
            autoplay: true,
            preload_time: 10.0,
            active_track_ids: Some(vec![1]),
        };

        let payload = Payload {
            request_id: Some(RequestId(7)),
            typ: media::LoadRequest::TYPE_NAME.to_string(),
            inner: req,
        };

        let json: serde_json::Value =
            serde_json::to_value(&payload).unwrap();

        assert_eq!(json["type"], "LOAD");
        assert_eq!(json["requestId"], 7);
        assert_eq!(json["sessionId"], "A1B2");
        assert_eq!(json["media"]["contentId"], "http://192.168.1.2:44301/video");
        assert_eq!(json["media"]["streamType"], "BUFFERED");
        assert_eq!(json["media"]["tracks"][0]["type"], "TEXT");
        assert_eq!(json["media"]["tracks"][0]["subtype"], "SUBTITLES");
        assert_eq!(json["media"]["tracks"][0]["trackContentType"], "text/vtt");
        assert_eq!(json["activeTrackIds"][0], 1);

        // Optional fields that are unset must be absent, not null.
        assert!(json["media"].get("metadata").is_none());
    }

    #[test]
    fn media_status_parses_typed_states() {
        let json = r#"{
            "type": "MEDIA_STATUS",
            "requestId": 0,
            "status": [{
                "mediaSessionId": 4,
                "playbackRate": 1.0,
                "playerState": "IDLE",
                "idleReason": "FINISHED",
                "currentTime": 1204.5,
                "supportedMediaCommands": 274447
            }]
        }"#;

        // The envelope and the tagged inner both come from the full
        // value, since the inner enum needs "type" for its tag.
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        let envelope: Payload<()> = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.typ, "MEDIA_STATUS");

        let resp: media::GetStatusResponse = serde_json::from_value(value).unwrap();
        let media::GetStatusResponse::Ok(status) = resp else {
            panic!("expected MEDIA_STATUS, got {resp:?}");
        };

        let entry = &status.entries[0];
        assert_eq!(entry.player_state, media::PlayerState::Idle);
        assert_eq!(entry.idle_reason, Some(media::IdleReason::Finished));
        assert_eq!(entry.current_time, Some(1204.5));
        assert_eq!(status.try_find_media_session_id().unwrap(), 4);
    }

    #[test]
    fn unknown_player_state_does_not_fail_parse() {
        let json = r#"{"mediaSessionId": 1, "playbackRate": 1.0,
                       "playerState": "SOME_FUTURE_STATE",
                       "supportedMediaCommands": 0}"#;
        let entry: media::StatusEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.player_state, media::PlayerState::Unknown);
    }

    #[test]
    fn load_response_error_variants_parse() {
        let json = r#"{"requestId": 3, "type": "LOAD_FAILED"}"#;
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        let resp: media::LoadResponse = serde_json::from_value(value).unwrap();
        assert!(matches!(resp, media::LoadResponse::LoadFailed));

        let json = r#"{"requestId": 4, "type": "INVALID_REQUEST",
                       "reason": "INVALID_MEDIA_SESSION_ID"}"#;
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        let resp: media::LoadResponse = serde_json::from_value(value).unwrap();
        let media::LoadResponse::InvalidRequest { reason } = resp else {
            panic!("wrong variant");
        };
        assert_eq!(reason, "INVALID_MEDIA_SESSION_ID");
    }
}
