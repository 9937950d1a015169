//! Astra Voice Gateway.
//!
//! Bridges external telephony and conferencing channels — WhatsApp calls
//! through the WATI provider, LiveKit rooms, direct WebRTC test clients —
//! to realtime AI model providers (OpenAI Realtime, Gemini Live). Each call
//! gets a full-duplex Opus audio path, a greeting→realtime conversation
//! state machine, per-tenant agent configuration, conversation records,
//! usage events, and optional dual-channel audio recordings.

pub mod agents;
pub mod app;
pub mod channels;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod model;
pub mod recording;
pub mod registry;
pub mod session;
pub mod store;
pub mod usage;
pub mod webrtc;
