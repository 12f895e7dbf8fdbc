//! Crate-wide error taxonomy.
//!
//! Back-ends keep local retries to themselves (sync attempts, readback
//! polling); everything that reaches this type has already been given up on.

use thiserror::Error;

/// Errors surfaced by the engine and the programmer back-ends.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad configuration, unknown part, or an operation the
    /// {programmer, part} pair cannot do. Not retryable.
    #[error("setup: {0}")]
    Setup(String),

    /// Short read/write, framing mismatch or timeout on the wire. The
    /// current command is abandoned; sync state may be lost.
    #[error("transport: {0}")]
    Transport(String),

    /// Underlying I/O failure from a transport implementation.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected sync or status byte from the device.
    #[error("protocol: {0}")]
    Protocol(String),

    /// The device reported a failure: NVM busy past timeout, readback
    /// mismatch outside masked bits, refused command.
    #[error("device: {0}")]
    Device(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The operation is legitimate but this programmer has no primitive
    /// for it; the caller may pick a fallback.
    #[error("operation not supported by this programmer")]
    Unsupported,

    /// A read failed in a way that the caller may treat as "proceed
    /// after chip erase". Used by signature reads on locked parts.
    #[error("read failed softly; a chip erase may recover the part")]
    SoftFail,

    /// A write would touch the resident bootloader.
    #[error("bootloader overlap: {0}")]
    BootloaderOverlap(String),

    /// Verification against the reference image failed.
    #[error("verification error: {mismatches} mismatch(es), first at {first_addr:#06x}")]
    Verify { mismatches: usize, first_addr: usize },
}

impl Error {
    /// True for [`Error::SoftFail`], which callers such as the signature
    /// reader may downgrade to a warning.
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::SoftFail)
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
