//! tdriver-rx: the receive side of a tdriver target.
//!
//! - [`RxBuffer`] accumulates inbound chunks and answers immediate
//!   ([`find`](RxBuffer::find)) and blocking ([`wait`](RxBuffer::wait))
//!   pattern lookups against them.
//! - [`ReceiverLoop`] is the background task that feeds an `RxBuffer` from a
//!   [`Connector`](tdriver_core::Connector) and records how the stream ended.
//!
//! Both are normally used through `tdriver::Target`.

pub mod buffer;
pub mod receiver;

pub use buffer::{MatchResult, RxBuffer, find_bytes};
pub use receiver::{LoopExit, LoopState, ReceiverLoop};
