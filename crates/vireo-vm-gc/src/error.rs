//! GC errors

/// Allocation failures surfaced to the memory manager.
///
/// These are not fatal by themselves: the memory manager runs the
/// collection ladder (minor GC, then major GC, then old-gen growth) and
/// only converts a persistent failure into the fatal out-of-memory error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Nursery bump space exhausted; run a minor collection and retry
    NurseryFull,
    /// Old generation at its configured limit; growth was denied
    OldGenFull,
}

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NurseryFull => write!(f, "nursery exhausted"),
            Self::OldGenFull => write!(f, "old generation at configured limit"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Internal GC invariant violations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcError {
    /// Handle does not name a live object
    DeadHandle(u32),
    /// Reference count would overflow u32
    RefCountOverflow(u32),
    /// Reference count would underflow (release of a dead object)
    RefCountUnderflow(u32),
}

impl std::fmt::Display for GcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeadHandle(h) => write!(f, "dead handle #{h}"),
            Self::RefCountOverflow(h) => write!(f, "refcount overflow on #{h}"),
            Self::RefCountUnderflow(h) => write!(f, "refcount underflow on #{h}"),
        }
    }
}

impl std::error::Error for GcError {}
