//! Streaming plumbing between a remote worker (or agent process) and the
//! engine: SSE framing, frame classification, incremental content assembly
//! and the task/message dialect translator.

pub mod assembler;
pub mod client;
pub mod sse;
pub mod translator;

pub use assembler::ContentAssembler;
pub use client::{classify_frame, pump_events, spawn_event_stream, ProtocolError, PumpOptions, WireProtocol};
pub use sse::{encode_frame, parse_sse_lines, SseDecoder, SseFrame};
pub use translator::{encode_event, A2aTranslator};
