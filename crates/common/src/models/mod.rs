mod session;

pub use session::SessionInfo;
