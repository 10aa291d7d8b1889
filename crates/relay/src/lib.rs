// peerpad-relay library entry point (embeddable collaboration engine).

pub mod config;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod storage;
pub mod ws;
