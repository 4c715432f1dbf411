use core::fmt;

/// Error kinds shared by the frame allocator and page-table engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    OutOfFrames,
    OutOfPool,
    AlreadyMapped,
    NotMapped,
    InvalidArgument,
    Conflict,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfFrames => write!(f, "no free frame run satisfies the request"),
            MemoryError::OutOfPool => write!(f, "page-table context's internal frame pool is exhausted"),
            MemoryError::AlreadyMapped => write!(f, "leaf slot already mapped to different backing"),
            MemoryError::NotMapped => write!(f, "virtual address has no mapping"),
            MemoryError::InvalidArgument => write!(f, "invalid argument"),
            MemoryError::Conflict => write!(f, "requested range overlaps an existing allocation"),
        }
    }
}
