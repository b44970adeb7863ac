//! ZWRITE and collation test vectors.
//!
//! Any engine behind the client must agree on these.

/// A value and its ZWRITE rendering.
#[derive(Debug, Clone)]
pub struct ZwrVector {
    /// Unique identifier for this vector.
    pub id: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Raw value bytes.
    pub raw: Vec<u8>,
    /// Expected ZWRITE form.
    pub zwr: &'static str,
}

/// ZWRITE encoding vectors.
pub fn zwrite_vectors() -> Vec<ZwrVector> {
    vec![
        ZwrVector {
            id: "zwr_empty",
            description: "Empty string is an empty quoted run",
            raw: Vec::new(),
            zwr: "\"\"",
        },
        ZwrVector {
            id: "zwr_text",
            description: "Printable text is quoted",
            raw: b"Go world".to_vec(),
            zwr: "\"Go world\"",
        },
        ZwrVector {
            id: "zwr_integer",
            description: "Canonical integer is bare",
            raw: b"42".to_vec(),
            zwr: "42",
        },
        ZwrVector {
            id: "zwr_negative_fraction",
            description: "Canonical fraction without leading zero is bare",
            raw: b"-.5".to_vec(),
            zwr: "-.5",
        },
        ZwrVector {
            id: "zwr_leading_zero",
            description: "Leading zero makes a number text",
            raw: b"042".to_vec(),
            zwr: "\"042\"",
        },
        ZwrVector {
            id: "zwr_trailing_zero",
            description: "Trailing fractional zero makes a number text",
            raw: b"1.50".to_vec(),
            zwr: "\"1.50\"",
        },
        ZwrVector {
            id: "zwr_quote",
            description: "Embedded quotes are doubled",
            raw: b"say \"hi\"".to_vec(),
            zwr: "\"say \"\"hi\"\"\"",
        },
        ZwrVector {
            id: "zwr_control_inside",
            description: "Control bytes split the quoted run",
            raw: b"a\tb".to_vec(),
            zwr: "\"a\"_$C(9)_\"b\"",
        },
        ZwrVector {
            id: "zwr_control_only",
            description: "Adjacent control bytes share one $C run",
            raw: vec![1, 2, 255],
            zwr: "$C(1,2,255)",
        },
    ]
}

/// Malformed ZWRITE strings that decoding must reject.
pub fn malformed_zwrite_vectors() -> Vec<&'static str> {
    vec!["\"open", "bare", "$C(300)", "$C(1", "\"a\"_", "$X(1)"]
}

/// Subscripts in collation order: empty first, canonical numbers
/// numerically, then everything else bytewise.
pub fn collation_vector() -> Vec<&'static [u8]> {
    vec![
        b"",
        b"-10",
        b"-1.5",
        b"-.5",
        b"0",
        b".25",
        b"1",
        b"2",
        b"10",
        b"-0",
        b"01",
        b"1.50",
        b"Winterfell",
        b"a",
        b"shire",
        b"world",
        b"\xff",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_vector_ids_unique() {
        let ids: HashSet<_> = zwrite_vectors().iter().map(|v| v.id).collect();
        assert_eq!(ids.len(), zwrite_vectors().len());
    }

    #[test]
    fn test_collation_vector_has_no_duplicates() {
        let subs: HashSet<_> = collation_vector().into_iter().collect();
        assert_eq!(subs.len(), collation_vector().len());
    }
}
