//! Line classifier for perftest output.
//!
//! Each call consumes one line and returns a [`ParseEvent`]. The only state
//! carried between lines is whether the separator row above the latency table
//! has been seen. Malformed content never panics or errors: startup banners
//! and error text are a normal part of the stream and come back as
//! [`ParseEvent::Unparseable`].

use crate::cli::TestMode;
use crate::results::{BandwidthSample, LatencySample};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static QPN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"QPN\s+(0x[0-9a-fA-F]+)").expect("valid regex"));
static PSN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"PSN\s+(0x[0-9a-fA-F]+)").expect("valid regex"));
static RKEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"RKey\s+(0x[0-9a-fA-F]+)").expect("valid regex"));
static VADDR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"VAddr\s+(0x[0-9a-fA-F]+)").expect("valid regex"));
static LATENCY_ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\s+\d+").expect("valid regex"));

const BANDWIDTH_MIN_FIELDS: usize = 5;
const LATENCY_MIN_FIELDS: usize = 9;

/// Which end of the queue pair a connection line describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSide {
    Local,
    Remote,
    Unknown,
}

/// Queue-pair metadata from a `local address:` / `remote address:` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub side: ConnectionSide,
    pub qpn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psn: Option<String>,
    pub rkey: String,
    pub vaddr: String,
}

/// Why a line produced no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseIssue {
    /// Banner, error text, or any other shape that is not a data row.
    Unrecognized,
    /// A connection line missing one of QPN, RKey or VAddr.
    IncompleteConnection,
    /// A latency-shaped row before the table separator.
    BeforeHeader,
    /// A data-shaped row with a field that failed numeric conversion.
    Malformed { field: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    Ignore,
    HeaderBoundary,
    Connection(ConnectionInfo),
    Gid(String),
    Bandwidth(BandwidthSample),
    Latency(LatencySample),
    Unparseable(ParseIssue),
}

impl ParseEvent {
    /// True for events that prove the worker is producing real output.
    pub fn is_progress(&self) -> bool {
        !matches!(self, ParseEvent::Ignore | ParseEvent::Unparseable(_))
    }
}

/// Stateful wrapper over [`parse_line`] for one output stream.
#[derive(Debug, Clone)]
pub struct OutputParser {
    mode: TestMode,
    header_seen: bool,
}

impl OutputParser {
    pub fn new(mode: TestMode) -> Self {
        Self {
            mode,
            header_seen: false,
        }
    }

    pub fn feed(&mut self, line: &str) -> ParseEvent {
        parse_line(line, self.mode, &mut self.header_seen)
    }

    pub fn header_seen(&self) -> bool {
        self.header_seen
    }
}

/// Classify one line of benchmark output.
pub fn parse_line(line: &str, mode: TestMode, header_seen: &mut bool) -> ParseEvent {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return ParseEvent::Ignore;
    }

    if is_separator(line) {
        *header_seen = true;
        return ParseEvent::HeaderBoundary;
    }

    if line.contains("QPN") && line.contains("RKey") {
        return parse_connection(line);
    }

    if let Some(gid) = line.strip_prefix("GID:") {
        return ParseEvent::Gid(gid.trim().to_string());
    }

    match mode {
        TestMode::Bandwidth => parse_bandwidth_row(line),
        TestMode::Latency => parse_latency_row(line, *header_seen),
    }
}

fn is_separator(line: &str) -> bool {
    let mut chars = line.chars();
    match chars.next() {
        Some(first @ ('-' | '=')) => chars.all(|c| c == first),
        _ => false,
    }
}

fn capture(re: &Regex, line: &str) -> Option<String> {
    re.captures(line).map(|c| c[1].to_string())
}

fn parse_connection(line: &str) -> ParseEvent {
    let (Some(qpn), Some(rkey), Some(vaddr)) = (
        capture(&QPN_RE, line),
        capture(&RKEY_RE, line),
        capture(&VADDR_RE, line),
    ) else {
        return ParseEvent::Unparseable(ParseIssue::IncompleteConnection);
    };

    let side = if line.starts_with("local address") {
        ConnectionSide::Local
    } else if line.starts_with("remote address") {
        ConnectionSide::Remote
    } else {
        ConnectionSide::Unknown
    };

    ParseEvent::Connection(ConnectionInfo {
        side,
        qpn,
        psn: capture(&PSN_RE, line),
        rkey,
        vaddr,
    })
}

fn int_field(fields: &[&str], idx: usize, name: &'static str) -> Result<u64, ParseIssue> {
    fields[idx]
        .parse::<u64>()
        .map_err(|_| ParseIssue::Malformed { field: name })
}

fn float_field(fields: &[&str], idx: usize, name: &'static str) -> Result<f64, ParseIssue> {
    match fields[idx].parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseIssue::Malformed { field: name }),
    }
}

fn parse_bandwidth_row(line: &str) -> ParseEvent {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let leading_int = fields
        .first()
        .map_or(false, |f| f.bytes().all(|b| b.is_ascii_digit()));
    if !leading_int || fields.len() < BANDWIDTH_MIN_FIELDS {
        return ParseEvent::Unparseable(ParseIssue::Unrecognized);
    }

    let sample = (|| {
        Ok::<_, ParseIssue>(BandwidthSample {
            bytes: int_field(&fields, 0, "bytes")?,
            iterations: int_field(&fields, 1, "iterations")?,
            bw_avg_gbps: float_field(&fields, 3, "bw_avg_gbps")?,
            msg_rate_mpps: float_field(&fields, 4, "msg_rate_mpps")?,
        })
    })();

    match sample {
        Ok(s) => ParseEvent::Bandwidth(s),
        Err(issue) => ParseEvent::Unparseable(issue),
    }
}

fn parse_latency_row(line: &str, header_seen: bool) -> ParseEvent {
    if !LATENCY_ROW_RE.is_match(line) {
        return ParseEvent::Unparseable(ParseIssue::Unrecognized);
    }
    if !header_seen {
        return ParseEvent::Unparseable(ParseIssue::BeforeHeader);
    }
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < LATENCY_MIN_FIELDS {
        return ParseEvent::Unparseable(ParseIssue::Unrecognized);
    }

    let sample = (|| {
        Ok::<_, ParseIssue>(LatencySample {
            payload_size: int_field(&fields, 0, "payload_size")?,
            iterations: int_field(&fields, 1, "iterations")?,
            t_min_usec: float_field(&fields, 2, "t_min_usec")?,
            t_max_usec: float_field(&fields, 3, "t_max_usec")?,
            t_typical_usec: float_field(&fields, 4, "t_typical_usec")?,
            t_avg_usec: float_field(&fields, 5, "t_avg_usec")?,
            t_stdev_usec: float_field(&fields, 6, "t_stdev_usec")?,
            t_99_usec: float_field(&fields, 7, "t_99_percentile_usec")?,
            t_999_usec: float_field(&fields, 8, "t_999_percentile_usec")?,
        })
    })();

    match sample {
        Ok(s) => ParseEvent::Latency(s),
        Err(issue) => ParseEvent::Unparseable(issue),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEPARATOR: &str =
        "---------------------------------------------------------------------------------------";

    fn bw(line: &str) -> ParseEvent {
        OutputParser::new(TestMode::Bandwidth).feed(line)
    }

    #[test]
    fn test_blank_and_comment_lines_are_ignored() {
        for line in ["", "   ", "\t", "# bytes     #iterations    BW peak[Gb/sec]"] {
            assert_eq!(bw(line), ParseEvent::Ignore);
        }
    }

    #[test]
    fn test_bandwidth_row() {
        let event = bw(" 65536      5000             0.00               97.52              0.186000   \t");
        assert_eq!(
            event,
            ParseEvent::Bandwidth(BandwidthSample {
                bytes: 65536,
                iterations: 5000,
                bw_avg_gbps: 97.52,
                msg_rate_mpps: 0.186,
            })
        );
    }

    #[test]
    fn test_bandwidth_row_exact_values() {
        for (bw_val, rate) in [(0.0, 0.0), (123.456789, 0.000001), (399.99, 12.5)] {
            let line = format!("4096 1000 1.0 {} {}", bw_val, rate);
            match bw(&line) {
                ParseEvent::Bandwidth(s) => {
                    assert_eq!(s.bytes, 4096);
                    assert_eq!(s.iterations, 1000);
                    assert_eq!(s.bw_avg_gbps, bw_val);
                    assert_eq!(s.msg_rate_mpps, rate);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_bandwidth_row_with_bad_number_is_malformed() {
        assert_eq!(
            bw("65536 5000 0.00 fast 0.18"),
            ParseEvent::Unparseable(ParseIssue::Malformed { field: "bw_avg_gbps" })
        );
        assert_eq!(
            bw("65536 5000 0.00 97.5 NaN"),
            ParseEvent::Unparseable(ParseIssue::Malformed { field: "msg_rate_mpps" })
        );
    }

    #[test]
    fn test_short_and_banner_lines_are_unparseable() {
        for line in [
            "65536 5000 0.00",
            "RDMA_Write BW Test",
            "Couldn't connect to 10.0.0.2:18515",
            "-1 2 3 4 5",
        ] {
            assert_eq!(bw(line), ParseEvent::Unparseable(ParseIssue::Unrecognized), "{}", line);
        }
    }

    #[test]
    fn test_separator_sets_header() {
        let mut parser = OutputParser::new(TestMode::Latency);
        assert!(!parser.header_seen());
        assert_eq!(parser.feed(SEPARATOR), ParseEvent::HeaderBoundary);
        assert!(parser.header_seen());
        assert_eq!(parser.feed("====="), ParseEvent::HeaderBoundary);
    }

    #[test]
    fn test_single_dash_is_separator() {
        let mut parser = OutputParser::new(TestMode::Latency);
        assert_eq!(parser.feed("-"), ParseEvent::HeaderBoundary);
        assert!(parser.header_seen());
        assert_eq!(bw("-x-"), ParseEvent::Unparseable(ParseIssue::Unrecognized));
    }

    #[test]
    fn test_connection_line() {
        let line = " local address: LID 0000 QPN 0x0107 PSN 0x9f3e2a RKey 0x1fffbf VAddr 0x007f6b0e5ff000";
        assert_eq!(
            bw(line),
            ParseEvent::Connection(ConnectionInfo {
                side: ConnectionSide::Local,
                qpn: "0x0107".into(),
                psn: Some("0x9f3e2a".into()),
                rkey: "0x1fffbf".into(),
                vaddr: "0x007f6b0e5ff000".into(),
            })
        );

        let remote = "remote address: LID 0000 QPN 0x0108 PSN 0x1 RKey 0x2 VAddr 0x3";
        match bw(remote) {
            ParseEvent::Connection(c) => assert_eq!(c.side, ConnectionSide::Remote),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_partial_connection_is_dropped() {
        assert_eq!(
            bw("local address: LID 0000 QPN 0x0107 PSN 0x9f RKey 0x1fffbf"),
            ParseEvent::Unparseable(ParseIssue::IncompleteConnection)
        );
    }

    #[test]
    fn test_gid_line() {
        assert_eq!(
            bw(" GID: 00:00:00:00:00:00:00:00:00:00:255:255:10:00:00:01 "),
            ParseEvent::Gid("00:00:00:00:00:00:00:00:00:00:255:255:10:00:00:01".into())
        );
    }

    #[test]
    fn test_latency_row_requires_header() {
        let row = " 2       1000          1.23           5.67         1.30             1.35             0.05            1.80                 4.20   ";
        let mut parser = OutputParser::new(TestMode::Latency);
        assert_eq!(parser.feed(row), ParseEvent::Unparseable(ParseIssue::BeforeHeader));

        parser.feed(SEPARATOR);
        assert_eq!(
            parser.feed(row),
            ParseEvent::Latency(LatencySample {
                payload_size: 2,
                iterations: 1000,
                t_min_usec: 1.23,
                t_max_usec: 5.67,
                t_typical_usec: 1.30,
                t_avg_usec: 1.35,
                t_stdev_usec: 0.05,
                t_99_usec: 1.80,
                t_999_usec: 4.20,
            })
        );
    }

    #[test]
    fn test_latency_row_too_short() {
        let mut parser = OutputParser::new(TestMode::Latency);
        parser.feed(SEPARATOR);
        assert_eq!(
            parser.feed("2 1000 1.23 5.67 1.30"),
            ParseEvent::Unparseable(ParseIssue::Unrecognized)
        );
    }

    #[test]
    fn test_modes_do_not_cross() {
        // A latency table row must never populate a bandwidth sample and vice versa.
        let lat_row = "2 1000 1.23 5.67 1.30 1.35 0.05 1.80 4.20";
        let mut bw_parser = OutputParser::new(TestMode::Bandwidth);
        bw_parser.feed(SEPARATOR);
        assert!(matches!(bw_parser.feed(lat_row), ParseEvent::Bandwidth(_)));

        let mut lat_parser = OutputParser::new(TestMode::Latency);
        lat_parser.feed(SEPARATOR);
        assert!(!matches!(
            lat_parser.feed("65536 5000 0.00 97.52 0.18"),
            ParseEvent::Latency(_)
        ));
    }

    #[test]
    fn test_progress_classification() {
        assert!(!ParseEvent::Ignore.is_progress());
        assert!(!ParseEvent::Unparseable(ParseIssue::Unrecognized).is_progress());
        assert!(ParseEvent::HeaderBoundary.is_progress());
        assert!(ParseEvent::Gid("x".into()).is_progress());
    }
}
