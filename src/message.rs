use crate::types::{EndpointId, Namespace};
use std::fmt::Debug;

#[derive(Clone)]
pub enum CastMessagePayload {
    String(String),
    Binary(Vec<u8>),
}

/// One message exchanged between sender and receiver over the cast channel.
#[derive(Clone, Debug)]
pub struct CastMessage {
    /// A namespace is a labeled protocol: messages exchanged over the cast
    /// channel carry a namespace identifying the protocol of the message.
    pub namespace: Namespace,

    /// Endpoint id of the sender of this message.
    pub source: EndpointId,

    /// Endpoint id this message is addressed to.
    pub destination: EndpointId,

    /// Payload data attached to the message (either string or binary).
    pub payload: CastMessagePayload,
}

impl From<String> for CastMessagePayload {
    fn from(s: String) -> CastMessagePayload {
        Self::String(s)
    }
}

impl From<Vec<u8>> for CastMessagePayload {
    fn from(b: Vec<u8>) -> CastMessagePayload {
        Self::Binary(b)
    }
}

impl Debug for CastMessagePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CastMessagePayload::String(s) => {
                f.debug_struct("CastMessagePayload::String")
                 .field("len", &s.len())
                 .finish_non_exhaustive()?;
            },
            CastMessagePayload::Binary(v) => {
                f.debug_struct("CastMessagePayload::Binary")
                 .field("len", &v.len())
                 .finish_non_exhaustive()?;
            },
        }

        Ok(())
    }
}
