//! On-disk segment format.
//!
//! Fixed-size structures with explicit field offsets so the layout is
//! identical across compilations. All integers are little-endian on
//! disk. A segment is a 16-byte header followed by fixed-length records;
//! there is no footer, so a torn tail is tolerated by construction.

/// Magic bytes at the start of every segment file.
pub const SEGMENT_MAGIC: [u8; 8] = *b"TKVSEG01";

/// Segment header: magic + format version + reserved.
pub const SEGMENT_HEADER_SIZE: usize = 16;

pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Fixed per-record header preceding the payload.
pub const RECORD_HEADER_SIZE: usize = 40;

/// Record layout: `[key:8][flags:8][version:8][freq:8][checksum:4][pad:4]`
/// followed by `total_dims * 4` payload bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: i64,       // 0..8
    pub flags: u64,     // 8..16
    pub version: i64,   // 16..24
    pub frequency: i64, // 24..32
    pub checksum: u32,  // 32..36
    pub _pad: u32,      // 36..40
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == RECORD_HEADER_SIZE);

impl RecordHeader {
    pub fn new(key: i64, flags: u64, version: i64, frequency: i64, payload: &[u8]) -> RecordHeader {
        let mut header = RecordHeader {
            key,
            flags,
            version,
            frequency,
            checksum: 0,
            _pad: 0,
        };
        header.checksum = header.compute_checksum(payload);
        header
    }

    /// CRC32 over the first 32 header bytes and the payload.
    pub fn compute_checksum(&self, payload: &[u8]) -> u32 {
        let mut crc = flate2::Crc::new();
        crc.update(&self.key.to_le_bytes());
        crc.update(&self.flags.to_le_bytes());
        crc.update(&self.version.to_le_bytes());
        crc.update(&self.frequency.to_le_bytes());
        crc.update(payload);
        crc.sum()
    }

    pub fn checksum_matches(&self, payload: &[u8]) -> bool {
        self.compute_checksum(payload) == self.checksum
    }

    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= RECORD_HEADER_SIZE);
        buf[0..8].copy_from_slice(&self.key.to_le_bytes());
        buf[8..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.version.to_le_bytes());
        buf[24..32].copy_from_slice(&self.frequency.to_le_bytes());
        buf[32..36].copy_from_slice(&self.checksum.to_le_bytes());
        buf[36..40].copy_from_slice(&[0u8; 4]);
    }

    pub fn decode(buf: &[u8]) -> RecordHeader {
        debug_assert!(buf.len() >= RECORD_HEADER_SIZE);
        RecordHeader {
            key: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            flags: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            version: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
            frequency: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
            checksum: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            _pad: 0,
        }
    }
}

/// Total on-disk bytes of one record for a given payload width.
pub fn record_bytes(total_dims: usize) -> usize {
    RECORD_HEADER_SIZE + total_dims * 4
}

pub fn encode_segment_header(buf: &mut [u8; SEGMENT_HEADER_SIZE]) {
    buf[0..8].copy_from_slice(&SEGMENT_MAGIC);
    buf[8..12].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
    buf[12..16].copy_from_slice(&[0u8; 4]);
}

/// Validates a segment header, returning the format version.
pub fn decode_segment_header(buf: &[u8]) -> Option<u32> {
    if buf.len() < SEGMENT_HEADER_SIZE || buf[0..8] != SEGMENT_MAGIC {
        return None;
    }
    Some(u32::from_le_bytes(buf[8..12].try_into().unwrap()))
}

/// Payload floats viewed as bytes, matching the on-disk layout.
pub fn floats_as_bytes(floats: &[f32]) -> &[u8] {
    // f32 has no padding; the store targets little-endian hosts.
    unsafe { std::slice::from_raw_parts(floats.as_ptr() as *const u8, floats.len() * 4) }
}

/// Decodes payload bytes into `out`; `bytes.len()` must be `4 * out.len()`.
pub fn bytes_to_floats(bytes: &[u8], out: &mut [f32]) {
    debug_assert_eq!(bytes.len(), out.len() * 4);
    for (chunk, slot) in bytes.chunks_exact(4).zip(out.iter_mut()) {
        *slot = f32::from_le_bytes(chunk.try_into().unwrap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let payload = [1.5f32, -2.0, 3.25];
        let bytes = floats_as_bytes(&payload);
        let header = RecordHeader::new(42, 0b11, 7, 99, bytes);
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        header.encode(&mut buf);
        let decoded = RecordHeader::decode(&buf);
        assert_eq!(decoded, header);
        assert!(decoded.checksum_matches(bytes));
    }

    #[test]
    fn checksum_catches_payload_flip() {
        let payload = [1.0f32; 4];
        let bytes = floats_as_bytes(&payload).to_vec();
        let header = RecordHeader::new(1, 0, 0, 0, &bytes);
        let mut bad = bytes.clone();
        bad[5] ^= 0x40;
        assert!(!header.checksum_matches(&bad));
    }

    #[test]
    fn payload_bytes_round_trip() {
        let payload = [0.0f32, f32::MAX, -1.0, 1e-7];
        let bytes = floats_as_bytes(&payload);
        let mut out = [0f32; 4];
        bytes_to_floats(bytes, &mut out);
        assert_eq!(out, payload);
    }

    #[test]
    fn segment_header_validates_magic() {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        encode_segment_header(&mut buf);
        assert_eq!(decode_segment_header(&buf), Some(SEGMENT_FORMAT_VERSION));
        buf[0] = b'X';
        assert_eq!(decode_segment_header(&buf), None);
    }
}
