//! Transport Layer
//!
//! Framing for the incremental event-stream protocol. The same line codec
//! decodes the upstream model's output and encodes (and, for clients,
//! decodes) the pipeline's own outbound frames.
//!
//! ```text
//!  upstream bytes ──▶ FrameDecoder ──▶ UpstreamFrame ──▶ relay
//!  relay ──▶ ClientFrame ──▶ FrameEncoder ──▶ client bytes
//! ```

pub mod frame;

pub use frame::{
    decode, decode_client_frames, encode, ClientFrameDecoder, DataLineReader, FrameDecoder,
    FrameEncoder, UpstreamFrame, DONE_MARKER, MAX_LINE_SIZE,
};
