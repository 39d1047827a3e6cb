pub mod conversation_persister;
pub mod frame_decoder;
#[cfg(test)]
pub(crate) mod scripted_opener;
pub mod session_gateway;
pub mod stream_transport;

pub use conversation_persister::ConversationPersister;
pub use frame_decoder::FrameDecoder;
pub use session_gateway::{GatewayError, PairedSession, SessionGateway, TokenStatus, normalize_site_url};
pub use stream_transport::{
    BodyObserver, ChatRequest, HttpStreamTransport, StreamCallbacks, StreamEvent, StreamEvents,
    StreamHandle, StreamOpener, StreamSink, TransportError, event_channel,
};
