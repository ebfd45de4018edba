//! Backslash escaping of string values, as MySQL reads them back.

/// Append `src` to `dst` with MySQL string escapes applied.
///
/// `\0 ' " \b \n \r \t \x1a \` are written as two-byte escapes; every other
/// byte is copied unchanged.
pub fn escape_into(src: &[u8], dst: &mut Vec<u8>) {
    dst.reserve(src.len());
    for &b in src {
        let escaped = match b {
            0 => b'0',
            b'\'' => b'\'',
            b'"' => b'"',
            0x08 => b'b',
            b'\n' => b'n',
            b'\r' => b'r',
            b'\t' => b't',
            0x1a => b'Z',
            b'\\' => b'\\',
            _ => {
                dst.push(b);
                continue;
            }
        };
        dst.push(b'\\');
        dst.push(escaped);
    }
}

/// Escaped copy of `src`.
pub fn escape(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + src.len() / 8);
    escape_into(src, &mut out);
    out
}

/// Reverse of [`escape`].
///
/// Unknown escapes keep the escaped byte, matching how MySQL reads `\x` for
/// other `x`. A trailing lone backslash is kept as is.
pub fn unescape(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut bytes = src.iter().copied();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'0') => out.push(0),
            Some(b'b') => out.push(0x08),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'Z') => out.push(0x1a),
            Some(other) => out.push(other),
            None => out.push(b'\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_specials() {
        assert_eq!(escape(b"O'Brien"), b"O\\'Brien");
        assert_eq!(escape(b"say \"hi\""), b"say \\\"hi\\\"");
        assert_eq!(escape(b"a\\b"), b"a\\\\b");
        assert_eq!(escape(b"l1\nl2\r\t"), b"l1\\nl2\\r\\t");
        assert_eq!(escape(&[0, 0x08, 0x1a]), b"\\0\\b\\Z");
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(escape(b"Ann"), b"Ann");
        assert_eq!(escape("zoë".as_bytes()), "zoë".as_bytes());
    }

    #[test]
    fn test_unescape_reverses_escape() {
        let mut every_byte: Vec<u8> = (0..=255u8).collect();
        every_byte.extend_from_slice(b"\\\\''\"\"");
        assert_eq!(unescape(&escape(&every_byte)), every_byte);
    }
}
