//! Handler modules
//!
//! Tunnel-side handlers (connect, response, disconnect) run per agent
//! connection; the forwarding handler serves public HTTP requests.

pub mod connect;
pub mod disconnect;
pub mod forwarding;
pub mod response;


pub use connect::handle_connect;
pub use disconnect::handle_disconnect;
pub use forwarding::handle_forwarding;
pub use response::handle_response;
