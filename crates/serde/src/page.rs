//! On-disk page framing.
//!
//! A spill file is a plain concatenation of records:
//!
//! ```text
//! row_count u32 | markers u8 | uncompressed_size u32 | size u32 | checksum u32 | payload[size]
//! ```
//!
//! All integers are little-endian. There is no file header, footer or index.

use std::io::{ErrorKind, Read, Write};

use spillway_common::{Result, SpillwayError};

use crate::markers::PageCodecMarkers;

pub const PAGE_HEADER_LEN: usize = 17;

/// A batch after compression, encryption and checksumming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedPage {
    pub row_count: u32,
    pub markers: PageCodecMarkers,
    pub uncompressed_size: u32,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl SerializedPage {
    /// Bytes this page occupies on disk, header included.
    pub fn encoded_len(&self) -> usize {
        PAGE_HEADER_LEN + self.payload.len()
    }

    /// Check the stored crc32 when the page is marked CHECKSUMMED.
    pub fn verify_checksum(&self) -> Result<()> {
        if !self.markers.is_checksummed() {
            return Ok(());
        }
        let actual = crc32fast::hash(&self.payload);
        if actual != self.checksum {
            return Err(SpillwayError::Corruption(format!(
                "page checksum mismatch: stored {:08x}, computed {actual:08x}",
                self.checksum
            )));
        }
        Ok(())
    }

    fn header(&self) -> Result<[u8; PAGE_HEADER_LEN]> {
        let size = u32::try_from(self.payload.len()).map_err(|_| {
            SpillwayError::Execution(format!(
                "page payload of {} bytes exceeds the record size limit",
                self.payload.len()
            ))
        })?;
        let mut header = [0u8; PAGE_HEADER_LEN];
        header[0..4].copy_from_slice(&self.row_count.to_le_bytes());
        header[4] = self.markers.byte();
        header[5..9].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        header[9..13].copy_from_slice(&size.to_le_bytes());
        header[13..17].copy_from_slice(&self.checksum.to_le_bytes());
        Ok(header)
    }
}

/// Write one record and return the number of bytes written.
pub fn write_serialized_page<W: Write>(out: &mut W, page: &SerializedPage) -> Result<usize> {
    out.write_all(&page.header()?)?;
    out.write_all(&page.payload)?;
    Ok(page.encoded_len())
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub row_count: u32,
    pub markers: PageCodecMarkers,
    pub uncompressed_size: u32,
    pub size: u32,
    pub checksum: u32,
}

impl PageHeader {
    pub fn parse(bytes: &[u8; PAGE_HEADER_LEN]) -> Result<Self> {
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        Ok(Self {
            row_count: u32_at(0),
            markers: PageCodecMarkers::from_byte(bytes[4])?,
            uncompressed_size: u32_at(5),
            size: u32_at(9),
            checksum: u32_at(13),
        })
    }
}

/// Read the next record header. `Ok(None)` at a clean end of input.
pub fn read_page_header<R: Read>(input: &mut R) -> Result<Option<PageHeader>> {
    let mut header = [0u8; PAGE_HEADER_LEN];
    let filled = read_full(input, &mut header)?;
    if filled == 0 {
        return Ok(None);
    }
    if filled < PAGE_HEADER_LEN {
        return Err(SpillwayError::Corruption(format!(
            "truncated page header: {filled} of {PAGE_HEADER_LEN} bytes"
        )));
    }
    PageHeader::parse(&header).map(Some)
}

/// Read the next record. `Ok(None)` at a clean end of input; a partial
/// header or payload is `Corruption`.
pub fn read_serialized_page<R: Read>(input: &mut R) -> Result<Option<SerializedPage>> {
    let Some(header) = read_page_header(input)? else {
        return Ok(None);
    };
    let mut payload = vec![0u8; header.size as usize];
    let filled = read_full(input, &mut payload)?;
    if filled < payload.len() {
        return Err(SpillwayError::Corruption(format!(
            "truncated page payload: {filled} of {} bytes",
            header.size
        )));
    }
    Ok(Some(SerializedPage {
        row_count: header.row_count,
        markers: header.markers,
        uncompressed_size: header.uncompressed_size,
        checksum: header.checksum,
        payload,
    }))
}

fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Iterator over the records of a byte stream. Ends after the first error.
#[derive(Debug)]
pub struct SerializedPageReader<R> {
    input: R,
    done: bool,
}

impl<R: Read> SerializedPageReader<R> {
    pub fn new(input: R) -> Self {
        Self { input, done: false }
    }
}

impl<R: Read> Iterator for SerializedPageReader<R> {
    type Item = Result<SerializedPage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_serialized_page(&mut self.input) {
            Ok(Some(page)) => Some(Ok(page)),
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

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn page(rows: u32, payload: &[u8]) -> SerializedPage {
        SerializedPage {
            row_count: rows,
            markers: PageCodecMarkers::CHECKSUMMED,
            uncompressed_size: payload.len() as u32,
            checksum: 0xdead_beef,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn header_layout_is_little_endian() {
        let mut buf = Vec::new();
        let written = write_serialized_page(&mut buf, &page(3, b"abc")).expect("write");
        assert_eq!(written, PAGE_HEADER_LEN + 3);
        assert_eq!(&buf[0..4], &3u32.to_le_bytes());
        assert_eq!(buf[4], 0x04);
        assert_eq!(&buf[9..13], &3u32.to_le_bytes());
        assert_eq!(&buf[13..17], &0xdead_beefu32.to_le_bytes());
        assert_eq!(&buf[17..], b"abc");
    }

    #[test]
    fn reader_yields_records_in_order() {
        let mut buf = Vec::new();
        for (rows, body) in [(1u32, &b"x"[..]), (0, &b""[..]), (7, &b"seven.."[..])] {
            write_serialized_page(&mut buf, &page(rows, body)).expect("write");
        }
        let pages = SerializedPageReader::new(Cursor::new(buf))
            .collect::<Result<Vec<_>>>()
            .expect("read");
        let rows = pages.iter().map(|p| p.row_count).collect::<Vec<_>>();
        assert_eq!(rows, vec![1, 0, 7]);
        assert_eq!(pages[2].payload, b"seven..");
    }

    #[test]
    fn truncation_is_corruption_and_ends_iteration() {
        let mut buf = Vec::new();
        write_serialized_page(&mut buf, &page(1, b"first")).expect("write");
        write_serialized_page(&mut buf, &page(1, b"second")).expect("write");
        buf.truncate(buf.len() - 2);

        let mut reader = SerializedPageReader::new(Cursor::new(buf));
        assert!(reader.next().expect("first").is_ok());
        assert!(matches!(reader.next(), Some(Err(SpillwayError::Corruption(_)))));
        assert!(reader.next().is_none());

        let short_header = vec![0u8; PAGE_HEADER_LEN - 1];
        assert!(matches!(
            read_serialized_page(&mut Cursor::new(short_header)),
            Err(SpillwayError::Corruption(_))
        ));
    }

    #[test]
    fn reserved_marker_bits_are_rejected() {
        let mut buf = Vec::new();
        write_serialized_page(&mut buf, &page(1, b"p")).expect("write");
        buf[4] = 0x40;
        assert!(matches!(
            read_serialized_page(&mut Cursor::new(buf)),
            Err(SpillwayError::Corruption(_))
        ));
    }
}
