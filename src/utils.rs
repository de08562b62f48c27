//! Byte-buffer helpers shared by the key store and the loaders.

use std::io::{self, BufRead, BufReader, Read};

/// Returns `true` if every byte of `buf` is zero.
///
/// The key store has no separate validity flag: an all-zero slot is an
/// absent key. A derived key that happens to be all zero is therefore
/// indistinguishable from one that was never derived.
#[inline]
pub fn is_empty(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// Decode a trimmed hex string of any even length.
pub(crate) fn decode_hex(s: &str) -> Option<Vec<u8>> {
    hex::decode(s.trim()).ok()
}

/// Decode a hex string that must be exactly `N` bytes long.
pub(crate) fn decode_hex_n<const N: usize>(s: &str) -> Option<[u8; N]> {
    let mut out = [0u8; N];
    hex::decode_to_slice(s.trim(), &mut out).ok()?;
    Some(out)
}

/// Iterate over the lines of `reader` without the trailing `\n` or `\r\n`.
///
/// Bytes that are not valid UTF-8 become U+FFFD instead of failing the
/// read, so one badly encoded line cannot hide the rest of a file. Only
/// real I/O errors are yielded as `Err`.
pub(crate) fn lossy_lines<R: Read>(reader: R) -> impl Iterator<Item = io::Result<String>> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    std::iter::from_fn(move || {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Some(Ok(String::from_utf8_lossy(&buf).into_owned()))
            }
            Err(e) => Some(Err(e)),
        }
    })
}
