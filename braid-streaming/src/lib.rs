//! # braid-streaming
//!
//! Stream composition primitives for braid.
//!
//! This crate provides the two building blocks used to assemble the output
//! of a long-running, multi-stage run and to hand that output to several
//! readers at once.
//!
//! ## Core Concepts
//!
//! - **[`StitchableStream`]**: one output stream assembled by draining input
//!   streams sequentially, in the order they were added
//! - **[`StitchHandle`]** / **[`StreamMerger`]**: producer-side handles for
//!   adding inputs, closing, or terminating the output
//! - **[`MultiConsumerStream`]**: one source read once and broadcast to any
//!   number of independent [`ConsumerStream`]s
//! - **[`tee`]**: two full branches of one stream
//! - **[`StreamRecoverExt`]**: turn a stream's first error into a final item
//!
//! Items are [`StreamResult<T>`]; errors travel in-band so they can be
//! broadcast like values.
//!
//! ## Example - Stitching
//!
//! ```ignore
//! use braid_streaming::StitchableStream;
//! use futures::{stream, StreamExt};
//!
//! let (handle, output) = StitchableStream::create();
//! handle.add_stream(stream::iter(vec![Ok(1), Ok(2)]))?;
//! handle.add_stream(stream::iter(vec![Ok(3)]))?;
//! handle.close();
//!
//! let items: Vec<_> = output.collect().await;
//! ```
//!
//! ## Example - Fan-out
//!
//! ```ignore
//! use braid_streaming::MultiConsumerStream;
//!
//! let shared = MultiConsumerStream::new(source);
//! let live = shared.split();
//! let stored = shared.split();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod multi_consumer;
pub mod phase;
pub mod recover;
pub mod stitch;
pub mod tee;

// Re-exports
pub use error::{StreamError, StreamResult};
pub use multi_consumer::{ConsumerId, ConsumerStream, MultiConsumerStream};
pub use phase::StreamPhase;
pub use recover::{Recovery, RecoverStream, StreamRecoverExt};
pub use stitch::{StitchHandle, StitchableStream, StreamMerger};
pub use tee::{tee, StreamFanOutExt};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::{
        tee, ConsumerStream, MultiConsumerStream, Recovery, StitchHandle, StitchableStream,
        StreamError, StreamFanOutExt, StreamMerger, StreamPhase, StreamRecoverExt, StreamResult,
    };
}
