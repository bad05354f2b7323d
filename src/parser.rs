/// Line-oriented state machine over `kaf consume` output.
///
/// The consumer prints a `Partition: <n>` header followed by an `Offset: <n>`
/// line for every record it reads. Everything else it prints (connection
/// chatter, record keys and values) is ignored.
use regex::Regex;
use std::sync::LazyLock;

static PARTITION_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Partition:\s+([0-9]+)").unwrap());

static OFFSET_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Offset:\s+([0-9]+)").unwrap());

/// A fully parsed (partition, offset) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub partition: u32,
    pub offset: u64,
}

/// Parser state between lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    /// No partition header is waiting for its offset.
    #[default]
    Idle,
    /// A partition header was read; the next `Offset:` line completes it.
    HavePartition(u32),
}

/// The consumer's output broke the partition/offset framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A second `Partition:` header arrived before the first one's offset.
    RepeatedPartition { pending: u32, next: u32 },
    /// A numeric field did not fit its type.
    InvalidNumber { field: &'static str, text: String },
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolViolation::RepeatedPartition { pending, next } => write!(
                f,
                "partition header {next} arrived while partition {pending} was still waiting for its offset"
            ),
            ProtocolViolation::InvalidNumber { field, text } => {
                write!(f, "{field} value {text:?} is out of range")
            }
        }
    }
}

impl std::error::Error for ProtocolViolation {}

/// Two-state parser: `Idle` and `HavePartition`.
///
/// [`OffsetParser::feed`] is the only transition function; each line moves
/// the machine at most one step.
#[derive(Debug, Default)]
pub struct OffsetParser {
    state: ParseState,
}

impl OffsetParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Apply one line of consumer output.
    ///
    /// Returns `Ok(Some(reading))` when the line completes a pending partition,
    /// `Ok(None)` when the line only moved the state or was ignored.
    pub fn feed(&mut self, line: &str) -> Result<Option<Reading>, ProtocolViolation> {
        if let Some(digits) = capture(&PARTITION_LINE, line) {
            let partition = parse_number::<u32>("partition", digits)?;
            if let ParseState::HavePartition(pending) = self.state {
                return Err(ProtocolViolation::RepeatedPartition {
                    pending,
                    next: partition,
                });
            }
            self.state = ParseState::HavePartition(partition);
            return Ok(None);
        }

        if let Some(digits) = capture(&OFFSET_LINE, line) {
            let ParseState::HavePartition(partition) = self.state else {
                tracing::warn!(line, "offset line without a partition header, ignoring");
                return Ok(None);
            };
            let offset = parse_number::<u64>("offset", digits)?;
            self.state = ParseState::Idle;
            return Ok(Some(Reading { partition, offset }));
        }

        Ok(None)
    }
}

fn capture<'a>(pattern: &Regex, line: &'a str) -> Option<&'a str> {
    pattern
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn parse_number<T: std::str::FromStr>(
    field: &'static str,
    digits: &str,
) -> Result<T, ProtocolViolation> {
    digits.parse().map_err(|_| ProtocolViolation::InvalidNumber {
        field,
        text: digits.to_string(),
    })
}
