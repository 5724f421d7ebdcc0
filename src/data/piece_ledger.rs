use bitvec::prelude::*;

pub type Bitfield = BitVec<u8, Msb0>;

/// Acquisition state of a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// No block acquired.
    Pending,
    /// Some but not all blocks acquired.
    Partial,
    /// All blocks acquired, hash not checked yet.
    Complete,
    /// Hash matched. Terminal until an explicit reset.
    Verified,
}

/// Tracks which blocks of one piece have been written and whether the piece
/// hash has been confirmed. The verified flag implies all blocks acquired.
pub struct PieceLedger {
    acquired: Bitfield,
    verified: bool,
}

impl PieceLedger {
    pub fn new(block_count: usize) -> Self {
        PieceLedger {
            acquired: Bitfield::repeat(false, block_count),
            verified: false,
        }
    }

    pub fn state(&self) -> PieceState {
        if self.verified {
            PieceState::Verified
        } else if self.acquired.all() {
            PieceState::Complete
        } else if self.acquired.any() {
            PieceState::Partial
        } else {
            PieceState::Pending
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn is_block_acquired(&self, block_index: usize) -> bool {
        self.acquired.get(block_index).is_some_and(|bit| *bit)
    }

    /// Mark a block acquired. Returns false if it already was.
    pub fn acquire_block(&mut self, block_index: usize) -> bool {
        let already_acquired = self.acquired.replace(block_index, true);
        !already_acquired
    }

    pub fn all_blocks_acquired(&self) -> bool {
        self.acquired.all()
    }

    pub fn acquired_block_count(&self) -> usize {
        self.acquired.count_ones()
    }

    pub fn mark_verified(&mut self) {
        self.acquired.fill(true);
        self.verified = true;
    }

    /// Discard all progress on this piece, returning it to `Pending`.
    pub fn reset(&mut self) {
        self.acquired.fill(false);
        self.verified = false;
    }
}
