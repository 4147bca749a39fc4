//! Stream Relay
//!
//! Per-request streaming context. Holds the only mutable state of a
//! request: the accumulated answer, the lifecycle state and the guarded
//! client sink.
//!
//! ```text
//!   upstream bytes ─▶ FrameDecoder ─▶ StreamRelay ─▶ ClientSink ─▶ client
//!                                         │
//!                                         └─▶ AccumulatedAnswer ─▶ finalize
//! ```

mod answer;
mod sink;
mod state;
mod stream_relay;

pub use answer::{AccumulatedAnswer, CANCELLATION_MARKER};
pub use sink::ClientSink;
pub use state::RelayState;
pub use stream_relay::{RelayOutcome, StreamRelay};
