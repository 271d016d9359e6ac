use crate::error::{Error, Result};
use bytemuck::{Pod, Zeroable};
use std::fmt;

pub type Square = u8;

/// Size in bytes of one record on disk.
pub const RECORD_SIZE: usize = size_of::<PositionRecord>();

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Color {
    White = 0,
    Black = 1,
}

impl Color {
    pub const ALL: [Color; 2] = [Color::White, Color::Black];

    pub fn flip(self) -> Self {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    pub fn idx(self) -> usize {
        self as usize
    }
}

/// Piece code 0..12: white pawn, knight, bishop, rook, queen, king, then the
/// black pieces in the same order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Piece(u8);

impl Piece {
    pub const COUNT: usize = 12;
    pub const WHITE_KING: Piece = Piece(5);
    pub const BLACK_KING: Piece = Piece(11);

    pub fn new(code: u8) -> Option<Self> {
        (usize::from(code) < Self::COUNT).then_some(Self(code))
    }

    pub fn code(self) -> u8 {
        self.0
    }

    pub fn color(self) -> Color {
        if self.0 < 6 {
            Color::White
        } else {
            Color::Black
        }
    }

    /// 0 = pawn .. 5 = king
    pub fn kind(self) -> u8 {
        self.0 % 6
    }

    pub fn is_king(self) -> bool {
        self.kind() == 5
    }

    /// Same piece type, other colour.
    pub fn invert(self) -> Self {
        Self((self.0 + 6) % 12)
    }

    pub fn from_char(c: char) -> Option<Self> {
        let code = match c {
            'P' => 0,
            'N' => 1,
            'B' => 2,
            'R' => 3,
            'Q' => 4,
            'K' => 5,
            'p' => 6,
            'n' => 7,
            'b' => 8,
            'r' => 9,
            'q' => 10,
            'k' => 11,
            _ => return None,
        };
        Some(Self(code))
    }
}

/// Reflects a square across the horizontal axis (rank 1 <-> rank 8).
pub fn mirror(sq: Square) -> Square {
    sq ^ 56
}

/// Fixed-size packed board as stored in binpack files. Squares count from a8
/// (0) to h1 (63); pieces are packed two per byte in ascending square order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct PositionRecord {
    stm: u8,
    wdl: u8,
    kings: [u8; 2],
    occupancy: [u8; 8],
    pieces: [u8; 16],
}

impl PositionRecord {
    /// Builds a record from `(square, piece)` pairs in any order. `wdl` is the
    /// game result from the side to move's point of view.
    pub fn from_pieces(stm: Color, wdl: u8, placement: &[(Square, Piece)]) -> Result<Self> {
        if placement.len() > 32 {
            return Err(Error::InvalidRecord(format!(
                "{} pieces do not fit in a record",
                placement.len()
            )));
        }

        let mut sorted = placement.to_vec();
        sorted.sort_unstable_by_key(|&(sq, _)| sq);

        let mut record = Self {
            stm: stm as u8,
            wdl,
            kings: [u8::MAX; 2],
            ..Self::default()
        };
        let mut occupancy = 0u64;
        for (n, &(sq, piece)) in sorted.iter().enumerate() {
            if sq >= 64 || occupancy & (1 << sq) != 0 {
                return Err(Error::InvalidRecord(format!("bad or repeated square {sq}")));
            }
            occupancy |= 1 << sq;
            record.pieces[n / 2] |= piece.code() << ((n & 1) * 4);
            if piece.is_king() {
                record.kings[piece.color().idx()] = sq;
            }
        }
        record.occupancy = occupancy.to_le_bytes();
        record.validate()?;
        Ok(record)
    }

    pub fn side_to_move(&self) -> Color {
        if self.stm == 0 {
            Color::White
        } else {
            Color::Black
        }
    }

    /// Result class from the side to move's view: 0 loss, 1 draw, 2 win.
    pub fn wdl(&self) -> u8 {
        self.wdl
    }

    pub fn king(&self, color: Color) -> Square {
        self.kings[color.idx()]
    }

    pub fn occupancy(&self) -> u64 {
        u64::from_le_bytes(self.occupancy)
    }

    pub fn piece_count(&self) -> usize {
        self.occupancy().count_ones() as usize
    }

    fn nibble(&self, n: usize) -> u8 {
        (self.pieces[n / 2] >> ((n & 1) * 4)) & 0xF
    }

    /// Occupied squares with their pieces, ascending by square.
    pub fn iter(&self) -> PieceIter<'_> {
        PieceIter {
            record: self,
            bb: self.occupancy(),
            n: 0,
        }
    }

    /// Checks every layout invariant. Records straight off disk go through
    /// here so that a corrupt file fails loudly instead of training on junk.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::InvalidRecord(msg));

        if self.stm > 1 {
            return fail(format!("side to move {}", self.stm));
        }
        if self.wdl > 2 {
            return fail(format!("result class {}", self.wdl));
        }

        let count = self.piece_count();
        for n in count..32 {
            if self.nibble(n) != 0 {
                return fail(format!("stray piece data after {count} pieces"));
            }
        }

        let mut kings = [0u8; 2];
        let mut bb = self.occupancy();
        for n in 0..count {
            let sq = bb.trailing_zeros() as Square;
            bb &= bb - 1;
            let Some(piece) = Piece::new(self.nibble(n)) else {
                return fail(format!("piece code {} on square {sq}", self.nibble(n)));
            };
            if piece.is_king() {
                let color = piece.color();
                kings[color.idx()] += 1;
                if self.kings[color.idx()] != sq {
                    return fail(format!("{color:?} king on {sq} but header says {}", self.king(color)));
                }
            }
        }

        if kings != [1, 1] {
            return fail(format!("expected one king per side, found {kings:?}"));
        }
        Ok(())
    }
}

impl fmt::Debug for PositionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PositionRecord")
            .field("stm", &self.side_to_move())
            .field("wdl", &self.wdl)
            .field("kings", &self.kings)
            .field("occupancy", &format_args!("{:#018x}", self.occupancy()))
            .finish()
    }
}

/// A record together with a reference score for it, already squashed into
/// `[0, 1]` from the side to move's view. Binpack files only store the record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoredPosition {
    pub record: PositionRecord,
    pub eval: Option<f32>,
}

pub struct PieceIter<'a> {
    record: &'a PositionRecord,
    bb: u64,
    n: usize,
}

impl Iterator for PieceIter<'_> {
    type Item = (Square, Piece);

    fn next(&mut self) -> Option<Self::Item> {
        if self.bb == 0 {
            return None;
        }
        let sq = self.bb.trailing_zeros() as Square;
        self.bb &= self.bb - 1;
        let code = self.record.nibble(self.n);
        self.n += 1;
        debug_assert!(usize::from(code) < Piece::COUNT);
        Some((sq, Piece(code)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.bb.count_ones() as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for PieceIter<'_> {}
