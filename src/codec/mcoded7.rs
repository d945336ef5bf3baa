//! Mcoded7: a 7-bit-safe encoding of arbitrary 8-bit data, used inside PE
//! bodies when `mutualEncoding` is `"Mcoded7"` or `"zlib+Mcoded7"`.
//!
//! Data is grouped into runs of up to 7 bytes. Each group is preceded by a
//! header byte whose low 7 bits carry the high bit of each data byte in the
//! group (byte `i`'s MSB lands at header bit `6 - i`); the data bytes
//! themselves are emitted with their high bit cleared.

/// Errors decoding an Mcoded7 byte stream.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Mcoded7Error {
    /// A byte that should be 7-bit-safe had bit 7 set.
    #[error("Mcoded7 byte at offset {0} has bit 7 set")]
    HighBitSet(usize),
}

/// Encode binary data into Mcoded7. Encoded length is `N + ceil(N/7)`; an
/// empty input encodes to an empty output.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + (data.len() + 6) / 7);
    for group in data.chunks(7) {
        let mut header = 0u8;
        for (i, byte) in group.iter().enumerate() {
            if byte & 0x80 != 0 {
                header |= 1 << (6 - i);
            }
        }
        out.push(header);
        out.extend(group.iter().map(|b| b & 0x7F));
    }
    out
}

/// Decode an Mcoded7 byte stream back into the original binary data.
pub fn decode(encoded: &[u8]) -> Result<Vec<u8>, Mcoded7Error> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut i = 0;
    while i < encoded.len() {
        let header = encoded[i];
        if header & 0x80 != 0 {
            return Err(Mcoded7Error::HighBitSet(i));
        }
        i += 1;
        let group_len = (encoded.len() - i).min(7);
        for j in 0..group_len {
            let byte = encoded[i + j];
            if byte & 0x80 != 0 {
                return Err(Mcoded7Error::HighBitSet(i + j));
            }
            let msb = (header >> (6 - j)) & 1;
            out.push((byte & 0x7F) | (msb << 7));
        }
        i += group_len;
    }
    Ok(out)
}
