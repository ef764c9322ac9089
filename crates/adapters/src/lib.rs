pub mod credentials;
pub mod event_stream;
pub mod http;

pub use event_stream::EventStreamDecoder;
pub use http::{HttpEventStream, HttpEventTransport};
