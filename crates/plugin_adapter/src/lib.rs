//! Adapter plugin control channel
//!
//! A running game server may load an adapter plugin that listens on a TCP
//! port. Through it the supervisor issues actions (chat, save, screenshot,
//! player list, scenario status) and receives pushed events (chat, join,
//! leave, scenario changes).
//!
//! - [`codec`]: frame splitting and request encoding
//! - [`client`]: the connection, pending-call table and event channel

pub mod client;
pub mod codec;
pub mod error;
pub mod types;

pub use client::{AdapterClient, DEFAULT_ACTION_TIMEOUT};
pub use codec::{encode_request, Correlator, Frame, FrameDecoder, RequestArg};
pub use error::{AdapterError, AdapterResult, FrameError};
pub use types::{actions, payload_text, AdapterEvent, PlayerEntry, ScenarioReport};
