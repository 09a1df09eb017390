//! Protocol message model and wire codec
//!
//! Typed representation of the modem application's line-oriented JSON
//! message API, and the codec that frames it over the socket.

pub mod codec;
pub mod message;

pub use self::codec::MessageCodec;
pub use self::message::{Command, DirectedText, Message, MessageKind, Params, EOM, ERR};
