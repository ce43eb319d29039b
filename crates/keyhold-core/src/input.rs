#![forbid(unsafe_code)]

//! Captured input units and batches.
//!
//! A chunk delivered by the host stream is split into [`InputUnit`]s: one
//! unit per UTF-8 scalar value, one opaque unit per byte that is not valid
//! UTF-8. Every unit of a chunk shares the chunk's arrival time, and is
//! flagged `part_of_sequence` when the chunk produced more than one unit, so
//! the consumer can reassemble escape sequences such as `ESC [ A`.
//!
//! # Invariants
//!
//! - Units within a batch are in arrival order.
//! - [`QueuedUnit::queued_at`] is never earlier than the unit's
//!   `arrived_at`.
//! - Splitting is lossless: concatenating the encoded units of every chunk
//!   (plus [`Utf8Splitter::finish`]) reproduces the input bytes exactly.

use std::time::{Duration, Instant};

/// Content of one captured unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitContent {
    /// A complete UTF-8 scalar value.
    Char(char),
    /// A byte that is not part of valid UTF-8.
    Byte(u8),
}

impl UnitContent {
    /// Append the raw bytes of this unit to `out`.
    pub fn encode_into(self, out: &mut Vec<u8>) {
        match self {
            Self::Char(c) => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            Self::Byte(b) => out.push(b),
        }
    }

    /// Number of raw bytes this unit occupies.
    #[must_use]
    pub const fn byte_len(self) -> usize {
        match self {
            Self::Char(c) => c.len_utf8(),
            Self::Byte(_) => 1,
        }
    }

    /// The character, if this unit is one.
    #[must_use]
    pub const fn as_char(self) -> Option<char> {
        match self {
            Self::Char(c) => Some(c),
            Self::Byte(_) => None,
        }
    }
}

impl From<char> for UnitContent {
    fn from(c: char) -> Self {
        Self::Char(c)
    }
}

/// One captured primitive with its arrival timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputUnit {
    /// The captured character or opaque byte.
    pub content: UnitContent,
    /// When the host delivered the chunk containing this unit.
    pub arrived_at: Instant,
    /// True when the unit arrived in a chunk that produced more than one unit.
    pub part_of_sequence: bool,
}

impl InputUnit {
    /// Create a standalone unit (not part of a multi-unit chunk).
    #[must_use]
    pub fn new(content: impl Into<UnitContent>, arrived_at: Instant) -> Self {
        Self {
            content: content.into(),
            arrived_at,
            part_of_sequence: false,
        }
    }

    /// Split a complete chunk into units.
    ///
    /// Unlike [`Utf8Splitter`], no state is carried between calls: a
    /// trailing incomplete UTF-8 sequence is emitted as opaque bytes.
    #[must_use]
    pub fn split_chunk(bytes: &[u8], arrived_at: Instant) -> Vec<Self> {
        let mut splitter = Utf8Splitter::new();
        let mut units = splitter.split(bytes, arrived_at);
        let tail = splitter.finish(arrived_at);
        if !tail.is_empty() {
            units.extend(tail);
            let in_sequence = units.len() > 1;
            for unit in &mut units {
                unit.part_of_sequence = in_sequence;
            }
        }
        units
    }
}

/// A unit accepted into the consumer-side queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedUnit {
    /// The captured unit.
    pub unit: InputUnit,
    /// When the unit entered the queue.
    pub queued_at: Instant,
}

impl QueuedUnit {
    /// Stamp `unit` as queued at `now`.
    ///
    /// A `now` earlier than the arrival time is clamped to the arrival time.
    #[must_use]
    pub fn stamp(unit: InputUnit, now: Instant) -> Self {
        Self {
            unit,
            queued_at: now.max(unit.arrived_at),
        }
    }

    /// Time between arrival at capture and acceptance into the queue.
    #[must_use]
    pub fn handoff_latency(&self) -> Duration {
        self.queued_at.duration_since(self.unit.arrived_at)
    }
}

/// Units captured within one coalescing window, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBatch {
    /// Units in arrival order.
    pub units: Vec<InputUnit>,
    /// When the batch was handed to the channel.
    pub batch_timestamp: Instant,
    /// Capture-side batch sequence number, starting at 0.
    pub seq: u64,
}

impl InputBatch {
    /// Number of units in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the batch holds no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Concatenated raw bytes of all units.
    #[must_use]
    pub fn content(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            unit.content.encode_into(&mut out);
        }
        out
    }

    /// Arrival time of the earliest unit.
    #[must_use]
    pub fn first_arrival(&self) -> Option<Instant> {
        self.units.first().map(|u| u.arrived_at)
    }
}

/// Stateful chunk splitter that completes UTF-8 characters split across reads.
///
/// At most three bytes are carried between calls (the longest incomplete
/// prefix of a four-byte sequence).
#[derive(Debug, Clone, Default)]
pub struct Utf8Splitter {
    carry: Vec<u8>,
}

impl Utf8Splitter {
    /// Create an empty splitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes held back waiting for the rest of a character.
    #[must_use]
    pub fn carried(&self) -> usize {
        self.carry.len()
    }

    /// Split a chunk into units stamped with `arrived_at`.
    pub fn split(&mut self, bytes: &[u8], arrived_at: Instant) -> Vec<InputUnit> {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(bytes);

        let mut contents = Vec::with_capacity(data.len());
        let mut rest = data.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    contents.extend(text.chars().map(UnitContent::Char));
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        contents.extend(text.chars().map(UnitContent::Char));
                    }
                    match err.error_len() {
                        Some(len) => {
                            contents.extend(after[..len].iter().copied().map(UnitContent::Byte));
                            rest = &after[len..];
                        }
                        None => {
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        let part_of_sequence = contents.len() > 1;
        contents
            .into_iter()
            .map(|content| InputUnit {
                content,
                arrived_at,
                part_of_sequence,
            })
            .collect()
    }

    /// Emit any carried bytes as opaque units and reset.
    pub fn finish(&mut self, arrived_at: Instant) -> Vec<InputUnit> {
        let carry = std::mem::take(&mut self.carry);
        let part_of_sequence = carry.len() > 1;
        carry
            .into_iter()
            .map(|b| InputUnit {
                content: UnitContent::Byte(b),
                arrived_at,
                part_of_sequence,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(units: &[InputUnit]) -> Vec<u8> {
        let mut out = Vec::new();
        for u in units {
            u.content.encode_into(&mut out);
        }
        out
    }

    #[test]
    fn single_char_is_not_part_of_sequence() {
        let now = Instant::now();
        let units = InputUnit::split_chunk(b"a", now);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].content, UnitContent::Char('a'));
        assert!(!units[0].part_of_sequence);
    }

    #[test]
    fn escape_sequence_units_are_tagged() {
        let now = Instant::now();
        let units = InputUnit::split_chunk(b"\x1b[A", now);
        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|u| u.part_of_sequence));
        assert!(units.iter().all(|u| u.arrived_at == now));
        assert_eq!(encode(&units), b"\x1b[A");
    }

    #[test]
    fn multibyte_char_is_one_unit() {
        let units = InputUnit::split_chunk("é".as_bytes(), Instant::now());
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].content, UnitContent::Char('é'));
        assert!(!units[0].part_of_sequence);
    }

    #[test]
    fn invalid_bytes_become_opaque_units() {
        let units = InputUnit::split_chunk(&[b'x', 0xff, b'y'], Instant::now());
        assert_eq!(
            units.iter().map(|u| u.content).collect::<Vec<_>>(),
            vec![
                UnitContent::Char('x'),
                UnitContent::Byte(0xff),
                UnitContent::Char('y')
            ]
        );
    }

    #[test]
    fn splitter_completes_char_across_reads() {
        let bytes = "ü".as_bytes();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(3);
        let mut splitter = Utf8Splitter::new();

        assert!(splitter.split(&bytes[..1], t0).is_empty());
        assert_eq!(splitter.carried(), 1);

        let units = splitter.split(&bytes[1..], t1);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].content, UnitContent::Char('ü'));
        assert_eq!(units[0].arrived_at, t1);
        assert_eq!(splitter.carried(), 0);
    }

    #[test]
    fn finish_flushes_incomplete_tail() {
        let bytes = "€".as_bytes();
        let now = Instant::now();
        let mut splitter = Utf8Splitter::new();
        assert!(splitter.split(&bytes[..2], now).is_empty());
        let tail = splitter.finish(now);
        assert_eq!(encode(&tail), &bytes[..2]);
        assert!(tail.iter().all(|u| matches!(u.content, UnitContent::Byte(_))));
        assert!(splitter.finish(now).is_empty());
    }

    #[test]
    fn empty_chunk_produces_nothing() {
        assert!(InputUnit::split_chunk(b"", Instant::now()).is_empty());
    }

    #[test]
    fn queued_at_never_precedes_arrival() {
        let arrived = Instant::now() + Duration::from_millis(10);
        let queued = QueuedUnit::stamp(InputUnit::new('q', arrived), Instant::now());
        assert_eq!(queued.queued_at, arrived);
        assert_eq!(queued.handoff_latency(), Duration::ZERO);
    }

    #[test]
    fn batch_content_concatenates_in_order() {
        let now = Instant::now();
        let batch = InputBatch {
            units: InputUnit::split_chunk("hé!".as_bytes(), now),
            batch_timestamp: now,
            seq: 0,
        };
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.content(), "hé!".as_bytes());
        assert_eq!(batch.first_arrival(), Some(now));
    }
}
