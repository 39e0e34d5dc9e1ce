use crate::payload::receiver::AppSessionId;
use serde::{Deserialize, Serialize};

pub type AppId = String;
pub type AppIdConst = &'static str;

/// Identifies one endpoint of the cast channel, e.g. `sender-0`,
/// `receiver-0`, or an app transport id.
pub type EndpointId = String;
pub type EndpointIdConst = &'static str;

pub const ENDPOINT_BROADCAST: EndpointIdConst = "*";

pub type MessageType = String;
pub type MessageTypeConst = &'static str;

pub type Namespace = String;
pub type NamespaceConst = &'static str;

pub type MediaSessionId = i32;

/// A running receiver app plus the endpoint ids needed to talk to it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppSession {
    pub app_destination_id: EndpointId,
    pub receiver_destination_id: EndpointId,

    pub app_session_id: AppSessionId,
}

/// An active media session within a receiver app.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MediaSession {
    #[serde(flatten)]
    pub app_session: AppSession,

    pub media_session_id: MediaSessionId,
}

impl MediaSession {
    pub fn app_destination_id(&self) -> &EndpointId {
        &self.app_session.app_destination_id
    }
}
