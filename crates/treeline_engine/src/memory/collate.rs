//! Subscript collation.
//!
//! The empty subscript sorts first, then canonical numbers in numeric order,
//! then every other string in byte order.

use std::cmp::Ordering;

/// Parses `s` if it is a canonical number.
///
/// Canonical numbers have no leading `+`, no leading zeros (so `.5`, not
/// `0.5`), no trailing fractional zeros and no exponent. `0` is canonical,
/// `-0` is not.
pub fn canonical_number(s: &[u8]) -> Option<f64> {
    let (negative, body) = match s.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some(_) => (false, s),
        None => return None,
    };
    if body.is_empty() {
        return None;
    }
    let (int, frac) = match body.iter().position(|&c| c == b'.') {
        Some(p) => (&body[..p], Some(&body[p + 1..])),
        None => (body, None),
    };
    if !int.iter().all(u8::is_ascii_digit) {
        return None;
    }
    match frac {
        Some(frac) => {
            if frac.is_empty() || !frac.iter().all(u8::is_ascii_digit) {
                return None;
            }
            if frac.last() == Some(&b'0') || int.first() == Some(&b'0') {
                return None;
            }
        }
        None => {
            if int.is_empty() || (int.len() > 1 && int[0] == b'0') {
                return None;
            }
            if negative && int == b"0" {
                return None;
            }
        }
    }
    std::str::from_utf8(s).ok()?.parse::<f64>().ok()
}

/// One subscript, ordered by collation rather than by bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sub(Vec<u8>);

impl Sub {
    /// Wraps raw subscript bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the subscript bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns true for the empty (null) subscript.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn rank(&self) -> (u8, Option<f64>) {
        if self.0.is_empty() {
            return (0, None);
        }
        match canonical_number(&self.0) {
            Some(n) => (1, Some(n)),
            None => (2, None),
        }
    }
}

impl Ord for Sub {
    fn cmp(&self, other: &Self) -> Ordering {
        let (ra, na) = self.rank();
        let (rb, nb) = other.rank();
        ra.cmp(&rb).then_with(|| {
            let numeric = match (na, nb) {
                (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            };
            // Bytes break ties between distinct numbers that share an f64.
            numeric.then_with(|| self.0.cmp(&other.0))
        })
    }
}

impl PartialOrd for Sub {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
