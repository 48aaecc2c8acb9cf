pub mod historical;
pub mod realtime;
