//! Unrecoverable runtime errors
//!
//! Nothing in the memory substrate can recover locally: once the
//! runtime cannot obtain or release memory it cannot continue running
//! user code. Failures are therefore propagated as a distinguished
//! `FatalError` up to a single top-level handler rather than aborting
//! from arbitrary call depth.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FatalError {
    /// The OS refused a mapping request
    #[error("mapping {size:#x} bytes failed: {source}")]
    MapFailed { size: usize, source: io::Error },
    /// The OS refused to release a mapping
    #[error("unmapping {size:#x} bytes at {base:#x} failed: {source}")]
    UnmapFailed {
        base: usize,
        size: usize,
        source: io::Error,
    },
    /// The OS refused a protection change
    #[error("changing protection of page at {base:#x} failed: {source}")]
    ProtectFailed { base: usize, source: io::Error },
    /// Growth could not satisfy a single allocation request
    #[error("unable to reserve enough room for {requested} bytes")]
    NurseryExhausted { requested: usize },
    /// A single frame larger than a whole stack segment can hold
    #[error("stack frame of {requested} bytes exceeds segment capacity")]
    FrameTooLarge { requested: usize },
    /// The collector returned without honouring its contract
    #[error("collector did not leave enough room for {requested} bytes")]
    CollectorContract { requested: usize },
}

/// The one place where an unrecoverable error becomes process
/// termination. Library code never exits; the embedding runtime calls
/// this at its outermost boundary.
pub fn terminate(err: FatalError) -> ! {
    log::error!("{}", err);
    std::process::exit(1);
}
