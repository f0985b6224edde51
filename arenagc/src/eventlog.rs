//! Instrumentation log: a stream of fixed-header records in native byte order,
//!
//! ```text
//! seconds: u32, nanoseconds: u32, event id: u8, payload length: u32, payload
//! ```
//!
//! written by the heap while it runs and read back by offline tooling.

use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the packed record header
pub const HEADER_SIZE: usize = 4 + 4 + 1 + 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    LogStart,
    LogStop,
    SweepStart,
    SweepDone,
    Allocate,
    NewArena,
    MarkStart,
    MarkDone,
    FreelistDump,
    AllocatorSwitch,
    Unknown(u8),
}

impl EventKind {
    pub fn id(self) -> u8 {
        match self {
            EventKind::LogStart => 0,
            EventKind::LogStop => 1,
            EventKind::SweepStart => 2,
            EventKind::SweepDone => 3,
            EventKind::Allocate => 4,
            EventKind::NewArena => 5,
            EventKind::MarkStart => 6,
            EventKind::MarkDone => 7,
            EventKind::FreelistDump => 8,
            EventKind::AllocatorSwitch => 9,
            EventKind::Unknown(id) => id,
        }
    }
}

impl From<u8> for EventKind {
    fn from(id: u8) -> EventKind {
        match id {
            0 => EventKind::LogStart,
            1 => EventKind::LogStop,
            2 => EventKind::SweepStart,
            3 => EventKind::SweepDone,
            4 => EventKind::Allocate,
            5 => EventKind::NewArena,
            6 => EventKind::MarkStart,
            7 => EventKind::MarkDone,
            8 => EventKind::FreelistDump,
            9 => EventKind::AllocatorSwitch,
            id => EventKind::Unknown(id),
        }
    }
}

/// Wall-clock time of an event, as seconds and nanoseconds since the epoch
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: u32,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Timestamp {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        Timestamp {
            secs: elapsed.as_secs() as u32,
            nanos: elapsed.subsec_nanos(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub time: Timestamp,
    pub kind: EventKind,
    pub payload: Vec<u8>,
}

impl Event {
    /// Interpret the payload as a sequence of native-endian u64 words,
    /// ignoring any trailing partial word
    pub fn payload_words(&self) -> impl Iterator<Item = u64> + '_ {
        self.payload.chunks_exact(8).map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_ne_bytes(word)
        })
    }
}

/// Fill `buf` from `reader`, returning how many bytes were read before end
/// of input
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(word)
}

/// Iterator over the events of a log. A truncated final record ends the
/// stream without an error.
pub struct EventReader<R> {
    inner: R,
    done: bool,
}

impl<R: Read> EventReader<R> {
    pub fn new(inner: R) -> EventReader<R> {
        EventReader { inner, done: false }
    }

    fn read_event(&mut self) -> io::Result<Option<Event>> {
        let mut header = [0u8; HEADER_SIZE];
        if read_full(&mut self.inner, &mut header)? < HEADER_SIZE {
            return Ok(None);
        }

        let secs = u32_at(&header, 0);
        let nanos = u32_at(&header, 4);
        let kind = EventKind::from(header[8]);
        let length = u32_at(&header, 9) as usize;

        // grows with the bytes actually present, not the length claimed
        let mut payload = Vec::new();
        (&mut self.inner)
            .take(length as u64)
            .read_to_end(&mut payload)?;
        if payload.len() < length {
            return Ok(None);
        }

        Ok(Some(Event {
            time: Timestamp { secs, nanos },
            kind,
            payload,
        }))
    }
}

impl<R: Read> Iterator for EventReader<R> {
    type Item = io::Result<Event>;

    fn next(&mut self) -> Option<io::Result<Event>> {
        if self.done {
            return None;
        }

        match self.read_event() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Writes event records. A `LogStart` record is written on creation and a
/// `LogStop` record by `finish`, or on drop if `finish` was never called.
pub struct EventWriter<W: Write> {
    out: W,
    finished: bool,
}

impl<W: Write> EventWriter<W> {
    pub fn new(out: W) -> io::Result<EventWriter<W>> {
        let mut writer = EventWriter {
            out,
            finished: false,
        };
        writer.log(EventKind::LogStart, &[])?;
        Ok(writer)
    }

    pub fn log(&mut self, kind: EventKind, payload: &[u8]) -> io::Result<()> {
        self.log_at(Timestamp::now(), kind, payload)
    }

    pub fn log_at(&mut self, time: Timestamp, kind: EventKind, payload: &[u8]) -> io::Result<()> {
        if payload.len() > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "event payload too large",
            ));
        }

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&time.secs.to_ne_bytes());
        header[4..8].copy_from_slice(&time.nanos.to_ne_bytes());
        header[8] = kind.id();
        header[9..13].copy_from_slice(&(payload.len() as u32).to_ne_bytes());

        self.out.write_all(&header)?;
        self.out.write_all(payload)
    }

    /// Write the closing `LogStop` record and flush
    pub fn finish(&mut self) -> io::Result<()> {
        if !self.finished {
            self.finished = true;
            self.log(EventKind::LogStop, &[])?;
        }
        self.out.flush()
    }
}

impl<W: Write> Drop for EventWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::warn!("could not close event log: {}", e);
        }
    }
}

/// Pack u64 words into a native-endian payload
pub fn words_payload<I: IntoIterator<Item = u64>>(words: I) -> Vec<u8> {
    words.into_iter().flat_map(|word| word.to_ne_bytes().to_vec()).collect()
}

#[cfg(test)]
mod tests {

    use super::*;

    fn record(secs: u32, nanos: u32, id: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&secs.to_ne_bytes());
        bytes.extend_from_slice(&nanos.to_ne_bytes());
        bytes.push(id);
        bytes.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    fn read_all(bytes: &[u8]) -> Vec<Event> {
        EventReader::new(bytes)
            .collect::<io::Result<Vec<Event>>>()
            .unwrap()
    }

    #[test]
    fn test_event_ids() {
        for id in 0..=255u8 {
            assert_eq!(EventKind::from(id).id(), id);
        }
        assert_eq!(EventKind::from(5), EventKind::NewArena);
        assert_eq!(EventKind::from(9), EventKind::AllocatorSwitch);
        assert_eq!(EventKind::from(10), EventKind::Unknown(10));
    }

    #[test]
    fn test_read_records() {
        let mut bytes = record(1, 500, 0, &[]);
        bytes.extend(record(2, 0, 5, &0xdead_0000u64.to_ne_bytes()));
        bytes.extend(record(3, 7, 42, &[1, 2, 3]));

        let events = read_all(&bytes);
        assert_eq!(events.len(), 3);

        assert_eq!(events[0].kind, EventKind::LogStart);
        assert_eq!(events[0].time, Timestamp { secs: 1, nanos: 500 });

        assert_eq!(events[1].kind, EventKind::NewArena);
        assert_eq!(events[1].payload_words().collect::<Vec<u64>>(), vec![0xdead_0000]);

        assert_eq!(events[2].kind, EventKind::Unknown(42));
        assert_eq!(events[2].payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_truncated_header_ends_stream() {
        let mut bytes = record(1, 0, 2, &[]);
        bytes.extend_from_slice(&[0u8; HEADER_SIZE - 1]);

        let events = read_all(&bytes);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::SweepStart);
    }

    #[test]
    fn test_truncated_payload_ends_stream() {
        let mut bytes = record(1, 0, 3, &[9; 8]);
        let partial = record(2, 0, 8, &[1; 16]);
        bytes.extend_from_slice(&partial[..partial.len() - 4]);

        let events = read_all(&bytes);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::SweepDone);
    }

    #[test]
    fn test_oversized_length_ends_stream() {
        let mut bytes = record(1, 0, 6, &[]);
        bytes.extend_from_slice(&2u32.to_ne_bytes());
        bytes.extend_from_slice(&0u32.to_ne_bytes());
        bytes.push(7);
        bytes.extend_from_slice(&u32::MAX.to_ne_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);

        let mut reader = EventReader::new(&bytes[..]);
        assert_eq!(reader.next().unwrap().unwrap().kind, EventKind::MarkStart);
        assert!(reader.next().is_none());
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_empty_log() {
        assert!(read_all(&[]).is_empty());
    }

    #[test]
    fn test_writer_brackets_log() {
        let mut bytes = Vec::new();
        {
            let mut writer = EventWriter::new(&mut bytes).unwrap();
            writer
                .log_at(Timestamp { secs: 10, nanos: 20 }, EventKind::MarkStart, &[])
                .unwrap();
            writer
                .log(EventKind::FreelistDump, &words_payload(vec![3, 40]))
                .unwrap();
        }

        let events = read_all(&bytes);
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::LogStart,
                EventKind::MarkStart,
                EventKind::FreelistDump,
                EventKind::LogStop
            ]
        );
        assert_eq!(events[1].time, Timestamp { secs: 10, nanos: 20 });
        assert_eq!(events[2].payload_words().collect::<Vec<u64>>(), vec![3, 40]);
    }

    #[test]
    fn test_finish_once() {
        let mut bytes = Vec::new();
        {
            let mut writer = EventWriter::new(&mut bytes).unwrap();
            writer.finish().unwrap();
        }
        assert_eq!(bytes.len(), 2 * HEADER_SIZE);
    }
}
