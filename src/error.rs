use thiserror::Error;

/// Errors produced by this crate.
///
/// Per spec.md §7, `Open`/`Lock`/`Grow`/`Mmap`/`Sync` (the IOError kind) and
/// `CorruptState` are fatal: there is no journal to recover from, so a
/// caller must never be left able to keep using a handle that has seen one.
/// These variants exist for their `Display`/logging value, but this crate
/// never returns them as a `Result::Err` — every site that would raise one
/// calls [`Error::fatal`] instead, which logs and aborts the process. Only
/// `OutOfSpace` (spec.md §7: "returned from `alloc_page` upward; exposed to
/// the caller of `put`") and `InvalidFormat` (an open-time "wrong file, not
/// a corrupted live one" condition — see `DESIGN.md`) are ordinary
/// recoverable `Result::Err`s.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Couldn't open, create, or stat the backing file. Fatal.
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't acquire the exclusive file lock required for single-handle access. Fatal.
    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't grow the backing file to cover a requested range. Fatal.
    #[error("can't extend the backing file to 0x{requested:x} bytes")]
    Grow {
        requested: u64,
        #[source]
        source: std::io::Error,
    },
    /// Couldn't establish or tear down a memory mapping. Fatal.
    #[error("memory-mapping the backing file failed")]
    Mmap(#[source] std::io::Error),
    /// Couldn't synchronize a dirty mapping to stable storage. Fatal.
    #[error("synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// No chunk has any free pages left to allocate. Recoverable — returned
    /// from `put`.
    #[error("allocator has no free pages left in any chunk")]
    OutOfSpace,
    /// A structural invariant was violated — the on-disk layout is
    /// inconsistent with what this crate wrote, or corrupted externally. Fatal.
    #[error("store invariant violated: {0}")]
    CorruptState(&'static str),
    /// The opened file doesn't look like a store file (bad magic) or fails
    /// its header checksum. Recoverable — returned from `open`.
    #[error("not a valid store file: {0}")]
    InvalidFormat(&'static str),
}

impl Error {
    /// Log and abort the process. The only way an `Open`/`Lock`/`Grow`/
    /// `Mmap`/`Sync`/`CorruptState` condition is ever handled — spec.md §7
    /// calls all of these fatal, so nothing in this crate constructs one of
    /// these variants as a `Result::Err` for a caller to inspect and
    /// continue past.
    pub(crate) fn fatal(self) -> ! {
        log::error!("fatal store error, aborting process: {self}");
        std::process::abort()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
