mod codec;
mod message;
mod request;
mod response;

pub use codec::TunnelCodec;
pub use message::{Frame, FrameKind, Message};
pub use request::HttpRequest;
pub use response::HttpResponse;
