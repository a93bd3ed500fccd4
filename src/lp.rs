// Line-protocol normalization
//
// Incoming writes are parsed and re-serialized one point per line. Points
// without a timestamp get the request receipt time, expressed in the
// precision the client declared.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use influxdb_line_protocol::parse_lines;
use thiserror::Error;

/// Timestamp units accepted by the v1 write API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
}

impl Precision {
    /// Parse a `precision` query value. Unrecognized values fall back to
    /// nanoseconds, the same lenient default the database applies.
    pub fn parse(s: &str) -> Precision {
        match s {
            "u" => Precision::Microseconds,
            "ms" => Precision::Milliseconds,
            "s" => Precision::Seconds,
            "m" => Precision::Minutes,
            "h" => Precision::Hours,
            _ => Precision::Nanoseconds,
        }
    }

    /// Nanoseconds per unit of this precision.
    fn divisor(&self) -> i64 {
        match self {
            Precision::Nanoseconds => 1,
            Precision::Microseconds => 1_000,
            Precision::Milliseconds => 1_000_000,
            Precision::Seconds => 1_000_000_000,
            Precision::Minutes => 60 * 1_000_000_000,
            Precision::Hours => 3_600 * 1_000_000_000,
        }
    }

    /// A wall-clock instant expressed in units of this precision.
    pub fn timestamp(&self, at: SystemTime) -> i64 {
        let nanos = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        nanos / self.divisor()
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("body is not valid utf-8")]
    NonUtf8(#[from] std::str::Utf8Error),

    #[error("invalid line protocol: {0}")]
    Parse(#[from] influxdb_line_protocol::Error),

    #[error("failed writing points: {0}")]
    Write(#[from] std::io::Error),
}

/// Parse `input` as line protocol and append each point to `out`, one line
/// per point. Points without a timestamp receive `default_timestamp`.
/// Returns the number of points written.
pub fn normalize_into<W: Write>(
    input: &[u8],
    default_timestamp: i64,
    out: &mut W,
) -> Result<usize, NormalizeError> {
    let text = std::str::from_utf8(input)?;

    let mut points = 0;
    for line in parse_lines(text) {
        let mut point = line?;
        if point.timestamp.is_none() {
            point.timestamp = Some(default_timestamp);
        }
        writeln!(out, "{point}")?;
        points += 1;
    }

    Ok(points)
}
