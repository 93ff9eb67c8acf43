//! Quantum tunnel wire protocol.
//!
//! Every frame is a `u32` big-endian length prefix followed by a JSON body.
//! The client sends exactly one `OpenTunnel` frame; the horizon answers with
//! `TunnelOpened` or `TunnelRejected`, and after an open it pushes `Events`
//! frames until either side goes away.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use relativity_core::{ApplicationId, ArtifactId, BoundedContextId, EventArtifact, Generation};
use relativity_events::{CommittedEventStream, InterestSet};

/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode frame: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode frame: {0}")]
    Decode(serde_json::Error),
}

/// Reasons a horizon refuses an `OpenTunnel` request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("application identifier is missing")]
    MissingApplication,

    #[error("bounded context identifier is missing")]
    MissingBoundedContext,

    #[error("no events were requested")]
    NoEvents,

    #[error("event artifact {0} is missing an identifier")]
    MissingArtifact(usize),

    #[error("event artifact {artifact} requested with invalid generation {generation}")]
    InvalidGeneration { artifact: ArtifactId, generation: Generation },
}

/// One requested event kind at one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventArtifactMessage {
    pub event: ArtifactId,
    pub generation: Generation,
}

impl From<EventArtifact> for EventArtifactMessage {
    fn from(artifact: EventArtifact) -> Self {
        Self {
            event: artifact.id(),
            generation: artifact.generation(),
        }
    }
}

/// Subscription handshake, sent once when the stream opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenTunnelMessage {
    pub application: ApplicationId,
    pub bounded_context: BoundedContextId,
    pub events: Vec<EventArtifactMessage>,
}

impl OpenTunnelMessage {
    pub fn new(
        application: ApplicationId,
        bounded_context: BoundedContextId,
        interest: &InterestSet,
    ) -> Self {
        Self {
            application,
            bounded_context,
            events: interest.artifacts().iter().copied().map(Into::into).collect(),
        }
    }

    /// Check the request and turn it into the subscriber's interest set.
    pub fn validate(&self) -> Result<InterestSet, HandshakeError> {
        if self.application.is_nil() {
            return Err(HandshakeError::MissingApplication);
        }
        if self.bounded_context.is_nil() {
            return Err(HandshakeError::MissingBoundedContext);
        }
        if self.events.is_empty() {
            return Err(HandshakeError::NoEvents);
        }

        let mut artifacts = Vec::with_capacity(self.events.len());
        for (index, requested) in self.events.iter().enumerate() {
            if requested.event.is_nil() {
                return Err(HandshakeError::MissingArtifact(index));
            }
            if !requested.generation.is_valid() {
                return Err(HandshakeError::InvalidGeneration {
                    artifact: requested.event,
                    generation: requested.generation,
                });
            }
            artifacts.push(EventArtifact::new(requested.event, requested.generation));
        }
        Ok(InterestSet::new(artifacts))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    OpenTunnel(OpenTunnelMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TunnelOpened,
    TunnelRejected { reason: String },
    Events { stream: Arc<CommittedEventStream> },
}

/// Length-delimited JSON codec, decoding `In` and encoding `Out`.
#[derive(Debug)]
pub struct HorizonCodec<In, Out> {
    frames: LengthDelimitedCodec,
    _messages: PhantomData<fn(Out) -> In>,
}

/// Codec used by the horizon side of a tunnel.
pub type ServerCodec = HorizonCodec<ClientMessage, ServerMessage>;

/// Codec used by the connecting side of a tunnel.
pub type ClientCodec = HorizonCodec<ServerMessage, ClientMessage>;

impl<In, Out> HorizonCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _messages: PhantomData,
        }
    }
}

impl<In, Out> Default for HorizonCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> Decoder for HorizonCodec<In, Out>
where
    In: DeserializeOwned,
{
    type Item = In;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => serde_json::from_slice(&frame)
                .map(Some)
                .map_err(WireError::Decode),
            None => Ok(None),
        }
    }
}

impl<In, Out> Encoder<Out> for HorizonCodec<In, Out>
where
    Out: Serialize,
{
    type Error = WireError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item).map_err(WireError::Encode)?;
        self.frames.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relativity_core::{CommitId, CorrelationId};

    fn artifact(generation: u32) -> EventArtifact {
        EventArtifact::new(ArtifactId::new(), Generation::new(generation).unwrap())
    }

    #[test]
    fn open_tunnel_survives_the_codec() {
        let interest = InterestSet::new([artifact(1), artifact(2)]);
        let open = OpenTunnelMessage::new(ApplicationId::new(), BoundedContextId::new(), &interest);

        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::new();
        client.encode(ClientMessage::OpenTunnel(open.clone()), &mut buf).unwrap();

        let ClientMessage::OpenTunnel(decoded) = server.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, open);
        assert_eq!(decoded.validate().unwrap(), interest);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let stream = CommittedEventStream::new(
            CommitId::new(),
            4,
            ApplicationId::new(),
            BoundedContextId::new(),
            CorrelationId::new(),
            Vec::new(),
        );
        let mut server = ServerCodec::new();
        let mut client = ClientCodec::new();
        let mut full = BytesMut::new();
        server
            .encode(ServerMessage::Events { stream: Arc::new(stream.clone()) }, &mut full)
            .unwrap();

        let mut partial = full.split_to(full.len() / 2);
        assert!(client.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);

        match client.decode(&mut partial).unwrap() {
            Some(ServerMessage::Events { stream: decoded }) => assert_eq!(*decoded, stream),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        let mut frames = LengthDelimitedCodec::new();
        let mut buf = BytesMut::new();
        frames.encode(Bytes::from_static(b"{not json"), &mut buf).unwrap();

        let mut client = ClientCodec::new();
        assert!(matches!(client.decode(&mut buf), Err(WireError::Decode(_))));
    }

    #[test]
    fn handshake_validation_rejects_bad_requests() {
        let good = InterestSet::new([artifact(1)]);
        let app = ApplicationId::new();
        let bc = BoundedContextId::new();

        let empty = OpenTunnelMessage::new(app, bc, &InterestSet::default());
        assert_eq!(empty.validate(), Err(HandshakeError::NoEvents));

        let mut nil_app = OpenTunnelMessage::new(app, bc, &good);
        nil_app.application = ApplicationId::from_uuid(uuid::Uuid::nil());
        assert_eq!(nil_app.validate(), Err(HandshakeError::MissingApplication));

        let zero: Generation = serde_json::from_str("0").unwrap();
        let mut bad_generation = OpenTunnelMessage::new(app, bc, &good);
        bad_generation.events[0].generation = zero;
        assert!(matches!(
            bad_generation.validate(),
            Err(HandshakeError::InvalidGeneration { .. })
        ));
    }
}
