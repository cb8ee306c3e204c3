//! Per-pool output buffers: one TBF `map { name -> [point, ...] }` document
//! per pool, built incrementally as the Decoder resolves each series to a
//! pool.

use cluster_core::Value;
use wire::Writer;

/// A framed header placeholder. The real framing (packet length, protocol
/// tag, request id) belongs to the socket layer this crate doesn't own; the
/// Repacker only needs a fixed-size marker so "empty buffer" has a stable
/// byte-length definition.
pub const HEADER_LEN: usize = 0;

/// One pool's accumulating output buffer.
///
/// Starts as `HEADER_LEN` placeholder bytes followed by `MAP_OPEN`; each
/// `start_series`/`point`/`end_series` triad appends one `name -> [..]`
/// entry. A buffer is "empty" (per spec) when nothing has been appended
/// beyond that opening marker — [`PoolBuffer::is_empty`] is exactly that
/// check, not `Writer::is_empty`.
#[derive(Debug, Clone)]
pub struct PoolBuffer {
    writer: Writer,
    entries: usize,
}

impl PoolBuffer {
    pub fn new() -> Self {
        let mut writer = Writer::with_capacity(HEADER_LEN + 1);
        writer.extend(&[0u8; HEADER_LEN]);
        writer.map_open();
        PoolBuffer { writer, entries: 0 }
    }

    /// True iff no series has been appended yet — the buffer carries only
    /// the header and the opening map marker.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// Appends `name -> points` as one map entry. `points` is encoded as
    /// `ARRAY_OPEN (ARRAY2 ts value)+ ARRAY_CLOSE`.
    pub fn push_series(&mut self, name: &[u8], points: &[(i64, Value)]) {
        self.writer.raw(name);
        self.writer.array_open();
        for (ts, value) in points {
            self.writer.array2();
            self.writer.int(*ts);
            write_value(&mut self.writer, value);
        }
        self.writer.array_close();
        self.entries += 1;
    }

    /// Begins a streamed entry: writes `raw(name)` and `ARRAY_OPEN`, and
    /// counts the entry immediately. Pair with [`PoolBuffer::push_point`]
    /// calls and a closing [`PoolBuffer::end_series`] — this is how the
    /// decoder appends points one at a time without buffering them first.
    pub fn start_series(&mut self, name: &[u8]) {
        self.writer.raw(name);
        self.writer.array_open();
        self.entries += 1;
    }

    pub fn push_point(&mut self, ts: i64, value: &Value) {
        self.writer.array2();
        self.writer.int(ts);
        write_value(&mut self.writer, value);
    }

    pub fn end_series(&mut self) {
        self.writer.array_close();
    }

    /// Splices an already-encoded `name -> [..]` fragment in verbatim,
    /// preserving its exact bytes — used when the array-form decoder
    /// buffers points ahead of the name, or when forwarding a fragment
    /// byte-for-byte.
    pub fn push_raw_entry(&mut self, fragment: &[u8]) {
        self.writer.extend(fragment);
        self.entries += 1;
    }

    /// Closes the map and terminates the document, returning the finished
    /// bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.writer.map_close();
        self.writer.end();
        self.writer.into_bytes()
    }

    /// Appends already-encoded bytes without counting a new entry — used to
    /// splice a scratch-decoded points sub-document in after
    /// [`PoolBuffer::start_series`] has already counted the entry.
    pub fn extend_raw(&mut self, bytes: &[u8]) {
        self.writer.extend(bytes);
    }
}

impl Default for PoolBuffer {
    fn default() -> Self {
        PoolBuffer::new()
    }
}

pub(crate) fn write_value(writer: &mut Writer, value: &Value) {
    match value {
        Value::Integer(v) => {
            writer.int(*v);
        }
        Value::Float(v) => {
            writer.float(*v);
        }
        Value::String(bytes) => {
            writer.raw(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::{Reader, Token};

    #[test]
    fn fresh_buffer_is_empty() {
        let buf = PoolBuffer::new();
        assert!(buf.is_empty());
    }

    #[test]
    fn pushing_a_series_makes_it_non_empty() {
        let mut buf = PoolBuffer::new();
        buf.push_series(b"cpu", &[(100, Value::Integer(1))]);
        assert!(!buf.is_empty());
        assert_eq!(buf.entry_count(), 1);
    }

    #[test]
    fn finished_buffer_round_trips_through_the_wire_reader() {
        let mut buf = PoolBuffer::new();
        buf.push_series(
            b"cpu",
            &[(100, Value::Integer(1)), (200, Value::Float(2.5))],
        );
        let bytes = buf.finish();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.next_token().unwrap(), Token::MapOpen);
        assert_eq!(r.next_token().unwrap(), Token::Raw(b"cpu"));
        assert_eq!(r.next_token().unwrap(), Token::ArrayOpen);
        assert_eq!(r.next_token().unwrap(), Token::Array2);
        assert_eq!(r.next_token().unwrap(), Token::Int(100));
        assert_eq!(r.next_token().unwrap(), Token::Int(1));
        assert_eq!(r.next_token().unwrap(), Token::Array2);
        assert_eq!(r.next_token().unwrap(), Token::Int(200));
        assert_eq!(r.next_token().unwrap(), Token::Float(2.5));
        assert_eq!(r.next_token().unwrap(), Token::ArrayClose);
        assert_eq!(r.next_token().unwrap(), Token::MapClose);
        assert_eq!(r.next_token().unwrap(), Token::End);
    }
}
