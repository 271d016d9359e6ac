//! Conversion of upstream data into binpack records: annotated FEN lines and
//! bulletformat files.

use crate::{
    dataloader::{read_up_to, write_records},
    error::{Error, Result},
    loss::sigmoid,
    record::{Color, Piece, PositionRecord, ScoredPosition, Square},
};
use bulletformat::{BulletFormat, ChessBoard};
use log::info;
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

/// Parses `"<fen> [<result>] [<eval>]"`, for example
/// `"4k3/8/8/8/8/8/4P3/4K3 w - - 0 1 [1.0] 250"`. The result (`[1.0]`,
/// `[0.5]` or `[0.0]`) and the optional centipawn eval are from white's
/// point of view; both are flipped when black is to move.
pub fn parse_line(line: &str, scale: f32) -> Result<ScoredPosition> {
    let fail = |reason| Error::InvalidFen {
        line: line.trim_end().to_string(),
        reason,
    };

    let mut fields = line.split_whitespace();
    let board = fields.next().ok_or_else(|| fail("empty line"))?;
    let stm = match fields.next() {
        Some("w") => Color::White,
        Some("b") => Color::Black,
        _ => return Err(fail("missing side to move")),
    };

    let mut placement = Vec::with_capacity(32);
    let mut sq: Square = 0;
    let mut ranks = 0;
    for c in board.chars() {
        match c {
            '1'..='8' => sq += c as u8 - b'0',
            '/' => {
                ranks += 1;
                if sq != 8 * ranks {
                    return Err(fail("bad rank"));
                }
            }
            _ => {
                let piece = Piece::from_char(c).ok_or_else(|| fail("invalid FEN char"))?;
                if sq >= 64 {
                    return Err(fail("too many squares"));
                }
                placement.push((sq, piece));
                sq += 1;
            }
        }
        if sq > 64 {
            return Err(fail("too many squares"));
        }
    }
    if sq != 64 {
        return Err(fail("bad rank"));
    }
    for color in Color::ALL {
        let king = match color {
            Color::White => Piece::WHITE_KING,
            Color::Black => Piece::BLACK_KING,
        };
        if placement.iter().filter(|&&(_, p)| p == king).count() != 1 {
            return Err(fail("kings not found"));
        }
    }

    let result_at = line.find('[').ok_or_else(|| fail("unknown result"))?;
    let rest = &line[result_at..];
    let white_wdl = if rest.starts_with("[1.0]") {
        2
    } else if rest.starts_with("[0.5]") {
        1
    } else if rest.starts_with("[0.0]") {
        0
    } else {
        return Err(fail("unknown result"));
    };

    let eval = match rest[5..].split_whitespace().next() {
        Some(token) => {
            let cp: i32 = token.parse().map_err(|_| fail("unparsable eval"))?;
            Some(sigmoid(cp as f32, scale))
        }
        None => None,
    };

    let (wdl, eval) = match stm {
        Color::White => (white_wdl, eval),
        Color::Black => (2 - white_wdl, eval.map(|e| 1. - e)),
    };

    let record = PositionRecord::from_pieces(stm, wdl, &placement)?;
    Ok(ScoredPosition { record, eval })
}

/// Packs up to `limit` annotated FEN lines into a binpack file. Blank lines
/// are skipped. Returns the number of records written.
pub fn pack_text(input: impl AsRef<Path>, output: impl AsRef<Path>, limit: Option<u64>, scale: f32) -> Result<u64> {
    let reader = BufReader::new(File::open(input.as_ref())?);
    let mut out = BufWriter::new(File::create(output.as_ref())?);
    let mut count = 0u64;

    for line in reader.lines() {
        if limit.is_some_and(|l| count >= l) {
            break;
        }
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let pos = parse_line(&line, scale)?;
        write_records(&mut out, &[pos.record])?;
        count += 1;
        if count % 1_000_000 == 0 {
            info!("Wrote positions: [{count:>10}]");
        }
    }

    out.flush()?;
    info!("Wrote positions: [{count:>10}] to {}", output.as_ref().display());
    Ok(count)
}

impl ScoredPosition {
    /// bulletformat boards are stored from the side to move's point of view
    /// (colour bit clear = side to move, a1 = 0), so the record always has
    /// white to move.
    pub fn from_bulletformat(board: &ChessBoard, scale: f32) -> Result<Self> {
        let placement: Vec<(Square, Piece)> = board
            .into_iter()
            .map(|(piece, square)| {
                let code = (piece & 7) + 6 * u8::from(piece & 8 > 0);
                let piece = Piece::new(code)
                    .ok_or_else(|| Error::InvalidRecord(format!("bulletformat piece {piece}")))?;
                Ok((square ^ 56, piece))
            })
            .collect::<Result<_>>()?;

        let wdl = board.result_idx() as u8;
        let record = PositionRecord::from_pieces(Color::White, wdl, &placement)?;
        Ok(Self {
            record,
            eval: Some(sigmoid(f32::from(board.score()), scale)),
        })
    }
}

/// Converts a bulletformat file into binpack. The score carried by each
/// bulletformat board does not fit in a binpack record and is dropped.
pub fn import_bulletformat(input: impl AsRef<Path>, output: impl AsRef<Path>, scale: f32) -> Result<u64> {
    const CHUNK: usize = 1 << 16;
    let board_size = size_of::<ChessBoard>();

    let mut reader = BufReader::new(File::open(input.as_ref())?);
    let mut out = BufWriter::new(File::create(output.as_ref())?);
    let mut buffer = vec![0u8; CHUNK * board_size];
    let mut records = Vec::with_capacity(CHUNK);
    let mut count = 0u64;

    loop {
        let filled = read_up_to(&mut reader, &mut buffer)?;
        if filled % board_size != 0 {
            return Err(Error::RecordCount {
                path: input.as_ref().to_path_buf(),
                len: count * board_size as u64 + filled as u64,
                record_size: board_size,
            });
        }

        records.clear();
        for chunk in buffer[..filled].chunks_exact(board_size) {
            // SAFETY: `chunk` is exactly one `ChessBoard` long and the board is
            // plain integer data, so every bit pattern is a valid value.
            let board = unsafe { std::ptr::read_unaligned(chunk.as_ptr() as *const ChessBoard) };
            records.push(ScoredPosition::from_bulletformat(&board, scale)?.record);
        }
        write_records(&mut out, &records)?;
        count += records.len() as u64;

        if filled < buffer.len() {
            break;
        }
    }

    out.flush()?;
    info!("Imported {count} bulletformat boards into {}", output.as_ref().display());
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dataloader::read_all, loss::EVAL_SCALE};
    use std::str::FromStr;

    #[test]
    fn parses_start_position() {
        let line = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1 [0.5] 33";
        let pos = parse_line(line, EVAL_SCALE).unwrap();
        assert_eq!(pos.record.piece_count(), 32);
        assert_eq!(pos.record.king(Color::White), 60);
        assert_eq!(pos.record.king(Color::Black), 4);
        assert_eq!(pos.record.wdl(), 1);
        assert!(pos.eval.unwrap() > 0.5);
    }

    #[test]
    fn black_to_move_flips_the_labels() {
        let line = "4k3/8/8/8/8/8/4P3/4K3 b - - 0 1 [1.0] 400";
        let pos = parse_line(line, EVAL_SCALE).unwrap();
        assert_eq!(pos.record.side_to_move(), Color::Black);
        assert_eq!(pos.record.wdl(), 0);
        assert!(pos.eval.unwrap() < 0.5);
    }

    #[test]
    fn eval_is_optional() {
        let pos = parse_line("4k3/8/8/8/8/8/8/4K3 w - - 0 1 [0.0]", EVAL_SCALE).unwrap();
        assert_eq!(pos.eval, None);
        assert_eq!(pos.record.wdl(), 0);
    }

    #[test]
    fn bad_lines_are_errors() {
        for (line, reason) in [
            ("4k3/8/8/8/8/8/8/4X3 w - - 0 1 [0.5]", "invalid FEN char"),
            ("4k3/8/8/8/8/8/8/8 w - - 0 1 [0.5]", "kings not found"),
            ("4k3/8/8/8/8/8/8/4K3 w - - 0 1 [0.7]", "unknown result"),
            ("4k3/8/8/8/8/8/8/4K3 w - - 0 1", "unknown result"),
            ("4k4/7/8/8/8/8/8/4K3 w - - 0 1 [0.5]", "bad rank"),
            ("4k2/8/8/8/8/8/8/4K4 w - - 0 1 [0.5]", "bad rank"),
            ("4k3/8/8/8/8/8/4K3 w - - 0 1 [0.5]", "bad rank"),
        ] {
            match parse_line(line, EVAL_SCALE) {
                Err(Error::InvalidFen { reason: r, .. }) => assert_eq!(r, reason, "{line}"),
                other => panic!("{line}: {other:?}"),
            }
        }
    }

    #[test]
    fn pack_text_writes_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("fens.txt");
        let bin = dir.path().join("fens.binpack");
        std::fs::write(
            &text,
            "4k3/8/8/8/8/8/4P3/4K3 w - - 0 1 [1.0] 300\n\n4k3/8/8/8/8/8/4P3/4K3 b - - 0 1 [0.5] 0\n",
        )
        .unwrap();

        assert_eq!(pack_text(&text, &bin, None, EVAL_SCALE).unwrap(), 2);
        let records = read_all(&bin).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].wdl(), 2);
        assert_eq!(records[1].side_to_move(), Color::Black);

        assert_eq!(pack_text(&text, &bin, Some(1), EVAL_SCALE).unwrap(), 1);
    }

    #[test]
    fn bulletformat_boards_convert() {
        let board = ChessBoard::from_str("4k3/8/8/8/8/8/4P3/4K3 w - - 0 1 | 120 | 1.0").unwrap();
        let pos = ScoredPosition::from_bulletformat(&board, EVAL_SCALE).unwrap();
        assert_eq!(pos.record.piece_count(), 3);
        assert_eq!(pos.record.side_to_move(), Color::White);
        assert_eq!(pos.record.king(Color::White), 60);
        assert_eq!(pos.record.wdl(), 2);
        assert!(pos.eval.unwrap() > 0.5);
    }
}
