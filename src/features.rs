use crate::{
    error::{Error, Result},
    record::{Color, Piece, PositionRecord, Square},
};
use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

/// Inputs per king bucket: 12 pieces on 64 squares.
pub const BUCKET_INPUTS: usize = Piece::COUNT * 64;
pub const MAX_ACTIVE: usize = 32;

pub type FeatureList = ArrayVec<u16, MAX_ACTIVE>;

/// Active input features of one position, one list per perspective
/// (`features[Color::White.idx()]`, `features[Color::Black.idx()]`). Both lists
/// hold one entry per occupied square, in ascending square order.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct FeatureSet {
    pub features: [FeatureList; 2],
}

impl FeatureSet {
    pub fn perspective(&self, view: Color) -> &[u16] {
        &self.features[view.idx()]
    }

    pub fn len(&self) -> usize {
        self.features[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.features[0].is_empty()
    }
}

/// Maps a piece on a square to an input row, as seen from one side.
pub trait FeatureIndexer: Send + Sync {
    /// Number of input rows this indexer can address.
    fn inputs(&self) -> usize;

    /// `own_king` is the king of `view`'s colour.
    fn index(&self, piece: Piece, square: Square, own_king: Square, view: Color) -> usize;

    fn features(&self, record: &PositionRecord) -> FeatureSet {
        let kings = [record.king(Color::White), record.king(Color::Black)];
        let mut set = FeatureSet::default();
        for (square, piece) in record.iter() {
            for view in Color::ALL {
                let idx = self.index(piece, square, kings[view.idx()], view);
                debug_assert!(idx < self.inputs());
                set.features[view.idx()].push(idx as u16);
            }
        }
        set
    }
}

/// King square (already oriented to the viewing side) -> bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct KingBuckets {
    table: [u8; 64],
    count: usize,
}

impl KingBuckets {
    /// Every king square shares one set of weights.
    pub fn single() -> Self {
        Self {
            table: [0; 64],
            count: 1,
        }
    }

    /// One bucket per rank on the viewing side's half (ranks 1-4), with
    /// everything further up the board sharing the last one.
    pub fn by_rank() -> Self {
        let mut table = [0; 64];
        for (sq, bucket) in table.iter_mut().enumerate() {
            let rank_from_home = 7 - sq / 8;
            *bucket = rank_from_home.min(3) as u8;
        }
        Self { table, count: 4 }
    }

    pub fn from_table(table: [u8; 64]) -> Result<Self> {
        let count = usize::from(table.iter().copied().max().unwrap_or(0)) + 1;
        for bucket in 0..count {
            if !table.iter().any(|&b| usize::from(b) == bucket) {
                return Err(Error::Config(format!("king bucket {bucket} is never used")));
            }
        }
        Ok(Self { table, count })
    }

    pub fn bucket(&self, king: Square) -> usize {
        usize::from(self.table[usize::from(king)])
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn table(&self) -> &[u8; 64] {
        &self.table
    }
}

impl Default for KingBuckets {
    fn default() -> Self {
        Self::single()
    }
}

impl TryFrom<Vec<u8>> for KingBuckets {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self> {
        let table: [u8; 64] = value
            .try_into()
            .map_err(|v: Vec<u8>| Error::Config(format!("king bucket table has {} entries, expected 64", v.len())))?;
        Self::from_table(table)
    }
}

impl From<KingBuckets> for Vec<u8> {
    fn from(value: KingBuckets) -> Self {
        value.table.to_vec()
    }
}

/// Chess768 per king bucket, optionally mirrored so the own king always sits
/// on the e-h files.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KingBucketIndexer {
    pub buckets: KingBuckets,
    pub mirror: bool,
}

impl KingBucketIndexer {
    pub fn new(buckets: KingBuckets, mirror: bool) -> Self {
        Self { buckets, mirror }
    }
}

impl FeatureIndexer for KingBucketIndexer {
    fn inputs(&self) -> usize {
        self.buckets.count() * BUCKET_INPUTS
    }

    fn index(&self, piece: Piece, square: Square, own_king: Square, view: Color) -> usize {
        let flip = 56 * view as u8;
        let mut sq = square ^ flip;
        let mut king = own_king ^ flip;
        let pc = match view {
            Color::White => piece,
            Color::Black => piece.invert(),
        };

        if self.mirror && king & 4 == 0 {
            sq ^= 7;
            king ^= 7;
        }

        self.buckets.bucket(king) * BUCKET_INPUTS + usize::from(pc.code()) * 64 + usize::from(sq)
    }
}
