//! Binary COPY tuple encoder.
//!
//! The bulk writes (`addresses`, the name tables, `mailbox_messages`,
//! `part_numbers`, `header_fields`, `address_fields`) stream rows with
//! `COPY ... FROM STDIN WITH BINARY`. sqlx exposes the raw COPY channel
//! (`copy_in_raw`) but not the binary tuple format, so the encoding lives
//! here.
//!
//! Format reference: PostgreSQL binary copy, one 19-byte header
//! (signature, flags, extension length), then per tuple a 16-bit field
//! count followed by length-prefixed field values (-1 length for NULL),
//! then a 16-bit -1 trailer.

use chrono::{DateTime, Utc};

const SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";

/// Microseconds between the Unix epoch and the Postgres timestamp epoch
/// (2000-01-01T00:00:00Z).
const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// Accumulates binary COPY tuples for one `COPY ... FROM STDIN WITH BINARY`
/// statement. Rows must all carry `columns` fields; this is checked when the
/// stream is finished.
pub struct CopyWriter {
    columns: u16,
    buf: Vec<u8>,
    fields_in_row: u16,
    rows: usize,
    in_row: bool,
}

impl CopyWriter {
    pub fn new(columns: u16) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(SIGNATURE);
        buf.extend_from_slice(&0i32.to_be_bytes()); // flags
        buf.extend_from_slice(&0i32.to_be_bytes()); // header extension length
        Self {
            columns,
            buf,
            fields_in_row: 0,
            rows: 0,
            in_row: false,
        }
    }

    /// Begin the next tuple.
    pub fn begin_row(&mut self) {
        debug_assert!(!self.in_row, "previous row not finished");
        self.buf.extend_from_slice(&(self.columns as i16).to_be_bytes());
        self.fields_in_row = 0;
        self.in_row = true;
    }

    /// Finish the current tuple.
    pub fn end_row(&mut self) {
        debug_assert_eq!(self.fields_in_row, self.columns, "column count mismatch");
        self.rows += 1;
        self.in_row = false;
    }

    fn field(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(&(data.len() as i32).to_be_bytes());
        self.buf.extend_from_slice(data);
        self.fields_in_row += 1;
    }

    pub fn null(&mut self) {
        self.buf.extend_from_slice(&(-1i32).to_be_bytes());
        self.fields_in_row += 1;
    }

    pub fn int4(&mut self, value: i32) {
        self.field(&value.to_be_bytes());
    }

    pub fn int8(&mut self, value: i64) {
        self.field(&value.to_be_bytes());
    }

    pub fn text(&mut self, value: &str) {
        self.field(value.as_bytes());
    }

    pub fn bytea(&mut self, value: &[u8]) {
        self.field(value);
    }

    /// `timestamptz`: microseconds since 2000-01-01T00:00:00Z.
    pub fn timestamptz(&mut self, value: DateTime<Utc>) {
        let micros = value.timestamp_micros() - PG_EPOCH_MICROS;
        self.field(&micros.to_be_bytes());
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Terminate the stream and return the encoded bytes.
    pub fn finish(mut self) -> Vec<u8> {
        debug_assert!(!self.in_row, "row in progress at finish");
        self.buf.extend_from_slice(&(-1i16).to_be_bytes());
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn header_and_trailer() {
        let w = CopyWriter::new(1);
        let bytes = w.finish();
        assert_eq!(&bytes[..11], SIGNATURE);
        assert_eq!(&bytes[11..15], &[0, 0, 0, 0]);
        assert_eq!(&bytes[15..19], &[0, 0, 0, 0]);
        assert_eq!(&bytes[19..], &[0xff, 0xff]);
    }

    #[test]
    fn encodes_int_and_null_fields() {
        let mut w = CopyWriter::new(2);
        w.begin_row();
        w.int4(7);
        w.null();
        w.end_row();
        let bytes = w.finish();
        let tuple = &bytes[19..bytes.len() - 2];
        assert_eq!(
            tuple,
            &[
                0, 2, // field count
                0, 0, 0, 4, 0, 0, 0, 7, // int4 7
                0xff, 0xff, 0xff, 0xff, // NULL
            ]
        );
    }

    #[test]
    fn encodes_text_verbatim() {
        let mut w = CopyWriter::new(1);
        w.begin_row();
        w.text("hi");
        w.end_row();
        let bytes = w.finish();
        let tuple = &bytes[19..bytes.len() - 2];
        assert_eq!(tuple, &[0, 1, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn timestamptz_is_micros_since_pg_epoch() {
        let mut w = CopyWriter::new(1);
        // One second past the Postgres epoch.
        let ts = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 1).unwrap();
        w.begin_row();
        w.timestamptz(ts);
        w.end_row();
        let bytes = w.finish();
        let tuple = &bytes[19..bytes.len() - 2];
        assert_eq!(&tuple[..2], &[0, 1]);
        assert_eq!(&tuple[2..6], &8i32.to_be_bytes());
        assert_eq!(&tuple[6..14], &1_000_000i64.to_be_bytes());
    }

    #[test]
    fn counts_rows() {
        let mut w = CopyWriter::new(1);
        assert!(w.is_empty());
        w.begin_row();
        w.int4(1);
        w.end_row();
        assert_eq!(w.rows(), 1);
    }
}
