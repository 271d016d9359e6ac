use crate::{
    loss::EVAL_SCALE,
    network::{Activation, Architecture},
    packer::parse_line,
    record::{Color, Piece, PositionRecord, ScoredPosition},
};

pub const FENS: [&str; 4] = [
    // white to move and wins
    "4k3/8/8/8/8/8/3QP3/4K3 w - - 0 1 [1.0] 900",
    // black to move, white lost
    "r3k3/8/8/8/8/8/8/4K3 b - - 0 1 [0.0] -500",
    "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1 [0.5] 25",
    "4k3/8/8/8/8/8/8/q3K3 w - - 0 1 [0.0] -800",
];

pub fn small_arch() -> Architecture {
    Architecture {
        inputs: 768,
        hidden: 16,
        layers: vec![8],
        activation: Activation::ClippedRelu { max: 1. },
    }
}

/// Two won, one drawn and one lost position (side to move's view).
pub fn positions() -> Vec<ScoredPosition> {
    FENS.iter().map(|l| parse_line(l, EVAL_SCALE).unwrap()).collect()
}

/// Distinct, valid records told apart by the white king's square.
pub fn numbered_record(i: usize) -> PositionRecord {
    assert!(i < 60);
    let pc = |c| Piece::from_char(c).unwrap();
    PositionRecord::from_pieces(Color::White, (i % 3) as u8, &[(i as u8, pc('K')), (63, pc('k'))]).unwrap()
}

pub fn record_number(record: &PositionRecord) -> usize {
    usize::from(record.king(Color::White))
}
