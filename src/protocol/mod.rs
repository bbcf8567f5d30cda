//! Protocol Module
//!
//! git pkt-line framing and SSH channel request parsing.

pub mod constants;
pub mod pktline;
pub mod request;

pub use pktline::{Frame, Packet};
pub use request::ChannelRequest;
