pub mod session_api;
pub mod signaling;
