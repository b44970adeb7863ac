//! String-to-number coercion and canonical number formatting.

/// Largest magnitude an increment result may reach.
const NUM_LIMIT: f64 = 1e47;

/// Interprets the longest numeric prefix of `s`; strings with none are zero.
pub fn to_number(s: &[u8]) -> f64 {
    let mut end = 0;
    let mut negative = false;
    while end < s.len() && matches!(s[end], b'+' | b'-') {
        negative ^= s[end] == b'-';
        end += 1;
    }
    let start = end;
    let mut seen_dot = false;
    let mut digits = 0;
    while end < s.len() {
        match s[end] {
            b'0'..=b'9' => digits += 1,
            b'.' if !seen_dot => seen_dot = true,
            _ => break,
        }
        end += 1;
    }
    if digits == 0 {
        return 0.0;
    }
    let mut mantissa_end = end;
    if end < s.len() && s[end] == b'E' {
        let mut e = end + 1;
        if e < s.len() && matches!(s[e], b'+' | b'-') {
            e += 1;
        }
        let exp_start = e;
        while e < s.len() && s[e].is_ascii_digit() {
            e += 1;
        }
        if e > exp_start {
            mantissa_end = e;
        }
    }
    let text = std::str::from_utf8(&s[start..mantissa_end]).unwrap_or("0");
    let magnitude = text.parse::<f64>().unwrap_or(0.0);
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// Formats `v` in canonical form: `1`, `-.5`, `3.25`.
pub fn canonical(v: f64) -> String {
    if v == 0.0 {
        return "0".to_owned();
    }
    if v.fract() == 0.0 && v.abs() < 1e18 {
        return format!("{}", v as i64);
    }
    let mut s = format!("{v:.15}");
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    if let Some(rest) = s.strip_prefix("0.") {
        s = format!(".{rest}");
    } else if let Some(rest) = s.strip_prefix("-0.") {
        s = format!("-.{rest}");
    }
    s
}

/// Adds two numeric strings, returning the canonical sum or `None` on overflow.
pub fn add(current: &[u8], increment: &[u8]) -> Option<String> {
    let sum = to_number(current) + to_number(increment);
    if !sum.is_finite() || sum.abs() >= NUM_LIMIT {
        return None;
    }
    Some(canonical(sum))
}
