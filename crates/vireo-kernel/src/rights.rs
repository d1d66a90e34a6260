//! Handle rights: a monotonic bitmask checked at every object operation.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Rights: u32 {
        const DUPLICATE = 1 << 0;
        const TRANSFER  = 1 << 1;
        const READ      = 1 << 2;
        const WRITE     = 1 << 3;
        const EXECUTE   = 1 << 4;
        const MAP       = 1 << 5;
        const GET_INFO  = 1 << 6;
        const SIGNAL    = 1 << 7;
        const DESTROY   = 1 << 8;
    }
}

impl Rights {
    /// `duplicate` may only intersect, never add, rights.
    pub fn reduce(self, requested: Rights) -> Rights {
        self & requested
    }
}
