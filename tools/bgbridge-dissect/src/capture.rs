//! Text captures of bridge traffic.
//!
//! One chunk of bytes per line, tagged with the side that sent it:
//!
//! ```text
//! # optional comments
//! 0.000120 app  20 00 01 03
//! 0.004310 chip 20 06 01 03 6a d1 cf 44 ef 54
//! chip a0180304000f4830238c1a4
//! ```
//!
//! The timestamp (seconds) is optional. Hex may be spaced or not. Chunks from
//! one side are a continuous byte stream, so a frame may span lines.

use std::fmt;
use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent by the BLE chip.
    Chip,
    /// Sent by the hub application.
    App,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Chip => write!(f, "chip → app"),
            Direction::App => write!(f, "app → chip"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub timestamp: Option<f64>,
    pub direction: Direction,
    pub data: Vec<u8>,
}

fn parse_direction(word: &str) -> Option<Direction> {
    match word.to_ascii_lowercase().as_str() {
        "chip" | "rx" | "<" => Some(Direction::Chip),
        "app" | "tx" | ">" => Some(Direction::App),
        _ => None,
    }
}

/// Parse one capture line. Blank lines and comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Chunk>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut words = line.split_whitespace().peekable();
    let mut timestamp = None;
    if let Some(first) = words.peek() {
        if parse_direction(first).is_none() {
            timestamp = Some(
                first
                    .parse::<f64>()
                    .with_context(|| format!("Expected timestamp or direction, got {:?}", first))?,
            );
            words.next();
        }
    }

    let Some(direction) = words.next().and_then(parse_direction) else {
        bail!("Missing direction (chip or app)");
    };
    let hex: String = words.collect();
    let data = hex::decode(&hex).with_context(|| format!("Invalid hex {:?}", hex))?;

    Ok(Some(Chunk {
        timestamp,
        direction,
        data,
    }))
}

/// Read every chunk of a capture file, `-` for stdin.
pub fn read_capture(path: &Path) -> Result<Vec<Chunk>> {
    let reader: Box<dyn BufRead> = if path == Path::new("-") {
        Box::new(std::io::stdin().lock())
    } else {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open capture file: {:?}", path))?;
        Box::new(std::io::BufReader::new(file))
    };

    let mut chunks = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if let Some(chunk) =
            parse_line(&line).with_context(|| format!("{}:{}", path.display(), number + 1))?
        {
            chunks.push(chunk);
        }
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamped_line() {
        let chunk = parse_line("0.5 chip 20 02 01 00 00 00").unwrap().unwrap();
        assert_eq!(chunk.timestamp, Some(0.5));
        assert_eq!(chunk.direction, Direction::Chip);
        assert_eq!(chunk.data, vec![0x20, 0x02, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn untimed_unspaced_line() {
        let chunk = parse_line("app 20000103").unwrap().unwrap();
        assert_eq!(chunk.timestamp, None);
        assert_eq!(chunk.direction, Direction::App);
        assert_eq!(chunk.data, vec![0x20, 0x00, 0x01, 0x03]);
    }

    #[test]
    fn comments_and_blanks_skipped() {
        assert_eq!(parse_line("   ").unwrap(), None);
        assert_eq!(parse_line("# boot sequence").unwrap(), None);
    }

    #[test]
    fn errors() {
        assert!(parse_line("0.5 20 00").is_err());
        assert!(parse_line("chip 2").is_err());
        assert!(parse_line("soon chip 20").is_err());
    }
}
