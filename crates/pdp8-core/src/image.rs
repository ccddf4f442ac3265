//! Word images on the wire and on disk.
//!
//! A 12-bit word travels as a little-endian `u16` pair; the upper four bits
//! are dropped when decoding. A trailing odd byte is ignored.

pub fn words_from_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]) & 0o7777)
        .collect()
}

pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words
        .iter()
        .flat_map(|w| (w & 0o7777).to_le_bytes())
        .collect()
}
