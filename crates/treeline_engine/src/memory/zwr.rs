//! ZWRITE-format encoding.
//!
//! Canonical numbers are written bare. Everything else becomes a `_`-joined
//! sequence of quoted runs of printable ASCII (with `"` doubled) and
//! `$C(n,...)` runs for the remaining bytes.

use super::collate::canonical_number;

fn printable(b: u8) -> bool {
    (0x20..0x7f).contains(&b)
}

/// Encodes `input` in ZWRITE format.
pub fn encode(input: &[u8]) -> Vec<u8> {
    if canonical_number(input).is_some() {
        return input.to_vec();
    }
    if input.is_empty() {
        return b"\"\"".to_vec();
    }

    let mut out = Vec::with_capacity(input.len() + 2);
    let mut i = 0;
    while i < input.len() {
        if !out.is_empty() {
            out.push(b'_');
        }
        if printable(input[i]) {
            out.push(b'"');
            while i < input.len() && printable(input[i]) {
                if input[i] == b'"' {
                    out.push(b'"');
                }
                out.push(input[i]);
                i += 1;
            }
            out.push(b'"');
        } else {
            out.extend_from_slice(b"$C(");
            let mut first = true;
            while i < input.len() && !printable(input[i]) {
                if !first {
                    out.push(b',');
                }
                out.extend_from_slice(input[i].to_string().as_bytes());
                first = false;
                i += 1;
            }
            out.push(b')');
        }
    }
    out
}

/// Decodes a ZWRITE-format string; `None` when it is malformed.
pub fn decode(input: &[u8]) -> Option<Vec<u8>> {
    if input.is_empty() {
        return Some(Vec::new());
    }
    if canonical_number(input).is_some() {
        return Some(input.to_vec());
    }

    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    loop {
        match input.get(i)? {
            b'"' => {
                i += 1;
                loop {
                    match input.get(i)? {
                        b'"' if input.get(i + 1) == Some(&b'"') => {
                            out.push(b'"');
                            i += 2;
                        }
                        b'"' => {
                            i += 1;
                            break;
                        }
                        &c => {
                            out.push(c);
                            i += 1;
                        }
                    }
                }
            }
            b'$' => {
                let head = input.get(i..i + 3)?;
                if !head.eq_ignore_ascii_case(b"$C(") {
                    return None;
                }
                i += 3;
                loop {
                    let start = i;
                    while input.get(i).is_some_and(u8::is_ascii_digit) {
                        i += 1;
                    }
                    let code: u8 = std::str::from_utf8(&input[start..i]).ok()?.parse().ok()?;
                    out.push(code);
                    match input.get(i)? {
                        b',' => i += 1,
                        b')' => {
                            i += 1;
                            break;
                        }
                        _ => return None,
                    }
                }
            }
            _ => return None,
        }
        match input.get(i) {
            None => return Some(out),
            Some(b'_') => i += 1,
            Some(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encodes_mixed_content() {
        assert_eq!(encode(b"hello"), b"\"hello\"");
        assert_eq!(encode(b"a\tb"), b"\"a\"_$C(9)_\"b\"");
        assert_eq!(encode(b"say \"hi\""), b"\"say \"\"hi\"\"\"");
        assert_eq!(encode(b"\x01\x02"), b"$C(1,2)");
        assert_eq!(encode(b"42"), b"42");
        assert_eq!(encode(b"042"), b"\"042\"");
        assert_eq!(encode(b""), b"\"\"");
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in [&b"\"open"[..], b"bare", b"$C(300)", b"$C(1", b"\"a\"\"b\"x", b"\"a\"_", b"$X(1)"] {
            assert_eq!(decode(bad), None, "{}", String::from_utf8_lossy(bad));
        }
    }

    #[test]
    fn decode_accepts_lowercase_char() {
        assert_eq!(decode(b"$c(65)_\"b\""), Some(b"Ab".to_vec()));
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assert_eq!(decode(&encode(&bytes)), Some(bytes));
        }
    }
}
