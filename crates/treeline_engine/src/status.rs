//! Engine status codes and the message table.
//!
//! Zero is success. A few positive codes carry control-flow meaning
//! ([`TP_RESTART`], [`TP_ROLLBACK`], [`NOTOK`], [`LOCK_TIMEOUT`]). Errors are
//! negative and facility-coded: `-(FACILITY << 16 | message << 3 | severity)`.

/// Success.
pub const OK: i32 = 0;
/// Transaction logic asks the engine to restart the transaction.
pub const TP_RESTART: i32 = i32::MAX - 1;
/// Transaction logic asks the engine to roll back and return.
pub const TP_ROLLBACK: i32 = i32::MAX - 2;
/// Generic failure without a message.
pub const NOTOK: i32 = i32::MAX - 3;
/// A timed lock request expired.
pub const LOCK_TIMEOUT: i32 = i32::MAX - 4;

const FACILITY: i32 = 2294;

const WARNING: i32 = 0;
const ERROR: i32 = 2;
const FATAL: i32 = 4;

const fn code(message: i32, severity: i32) -> i32 {
    -((FACILITY << 16) | (message << 3) | severity)
}

/// An output buffer is smaller than the result.
pub const INVSTRLEN: i32 = code(1, ERROR);
/// An output subscript array has fewer elements than the result.
pub const INSUFFSUBS: i32 = code(2, ERROR);
/// Global variable is undefined.
pub const GVUNDEF: i32 = code(3, ERROR);
/// Local variable is undefined.
pub const LVUNDEF: i32 = code(4, ERROR);
/// No more subscripts or nodes in the requested direction.
pub const NODEEND: i32 = code(5, WARNING);
/// Variable name is malformed.
pub const INVVARNAME: i32 = code(6, ERROR);
/// Variable name is too long.
pub const VARNAME2LONG: i32 = code(7, ERROR);
/// Subscript count exceeds the engine limit.
pub const MAXNRSUBSCRIPTS: i32 = code(8, ERROR);
/// A parameter is invalid.
pub const PARAMINVALID: i32 = code(9, ERROR);
/// Too many variable names were supplied.
pub const NAMECOUNT2HI: i32 = code(10, ERROR);
/// Timeout exceeds the engine limit.
pub const TIME2LONG: i32 = code(11, ERROR);
/// Variadic lock arguments are not well formed.
pub const INVLNPAIRLIST: i32 = code(12, ERROR);
/// Variadic argument count exceeds the parameter block.
pub const PARMOFLOW: i32 = code(13, ERROR);
/// A structure was used before it was allocated.
pub const STRUCTNOTALLOCD: i32 = code(14, ERROR);
/// A ZWRITE-format string is malformed.
pub const INVZWRITECHAR: i32 = code(15, ERROR);
/// Numeric result overflows.
pub const NUMOFLOW: i32 = code(16, ERROR);
/// No call-in routine with the requested name.
pub const CINOENTRY: i32 = code(17, ERROR);
/// Transaction restarted more times than the engine allows.
pub const TPRETRYLIMIT: i32 = code(18, ERROR);
/// The engine has run down; no further calls are possible.
pub const CALLINAFTERXIT: i32 = code(19, FATAL);
/// Status does not correspond to a known message.
pub const UNKNOWNSYSERR: i32 = code(20, ERROR);
/// Transaction token does not match the active transaction.
pub const INVTPTRANS: i32 = code(21, ERROR);

struct Message {
    status: i32,
    mnemonic: &'static str,
    text: &'static str,
}

const MESSAGES: &[Message] = &[
    Message { status: INVSTRLEN, mnemonic: "INVSTRLEN", text: "Invalid string length: buffer too small for result" },
    Message { status: INSUFFSUBS, mnemonic: "INSUFFSUBS", text: "Return subscript array too small for result" },
    Message { status: GVUNDEF, mnemonic: "GVUNDEF", text: "Global variable undefined" },
    Message { status: LVUNDEF, mnemonic: "LVUNDEF", text: "Undefined local variable" },
    Message { status: NODEEND, mnemonic: "NODEEND", text: "End of list of nodes/subscripts" },
    Message { status: INVVARNAME, mnemonic: "INVVARNAME", text: "Invalid local or global variable name supplied to API call" },
    Message { status: VARNAME2LONG, mnemonic: "VARNAME2LONG", text: "Variable name length exceeds maximum allowed" },
    Message { status: MAXNRSUBSCRIPTS, mnemonic: "MAXNRSUBSCRIPTS", text: "Maximum number of subscripts exceeded" },
    Message { status: PARAMINVALID, mnemonic: "PARAMINVALID", text: "Invalid parameter specified in API call" },
    Message { status: NAMECOUNT2HI, mnemonic: "NAMECOUNT2HI", text: "Number of variable names exceeds maximum" },
    Message { status: TIME2LONG, mnemonic: "TIME2LONG", text: "Specified time value exceeds supported maximum" },
    Message { status: INVLNPAIRLIST, mnemonic: "INVLNPAIRLIST", text: "Invalid lockname/subscript pair list" },
    Message { status: PARMOFLOW, mnemonic: "PARMOFLOW", text: "Parameter list overflow" },
    Message { status: STRUCTNOTALLOCD, mnemonic: "STRUCTNOTALLOCD", text: "Structure not previously allocated" },
    Message { status: INVZWRITECHAR, mnemonic: "INVZWRITECHAR", text: "Invalid character in ZWRITE format string" },
    Message { status: NUMOFLOW, mnemonic: "NUMOFLOW", text: "Numeric overflow" },
    Message { status: CINOENTRY, mnemonic: "CINOENTRY", text: "No entry specified for routine in call-in table" },
    Message { status: TPRETRYLIMIT, mnemonic: "TPRETRYLIMIT", text: "Transaction restart limit reached" },
    Message { status: CALLINAFTERXIT, mnemonic: "CALLINAFTERXIT", text: "After engine exit, a process cannot make further calls" },
    Message { status: UNKNOWNSYSERR, mnemonic: "UNKNOWNSYSERR", text: "Status does not correspond to a known error code" },
    Message { status: INVTPTRANS, mnemonic: "INVTPTRANS", text: "Transaction token is not valid for the active transaction" },
];

fn lookup(status: i32) -> Option<&'static Message> {
    // The message table ignores the sign, like the native one.
    let wanted = -(status.checked_abs()?);
    MESSAGES.iter().find(|m| m.status == wanted)
}

/// Returns the mnemonic for `status`, e.g. `"GVUNDEF"`.
pub fn mnemonic(status: i32) -> Option<&'static str> {
    match status {
        OK => Some("OK"),
        TP_RESTART => Some("TP_RESTART"),
        TP_ROLLBACK => Some("TP_ROLLBACK"),
        NOTOK => Some("NOTOK"),
        LOCK_TIMEOUT => Some("LOCK_TIMEOUT"),
        _ => lookup(status).map(|m| m.mnemonic),
    }
}

/// Returns true for negative, facility-coded error statuses.
pub fn is_error(status: i32) -> bool {
    status < 0
}

fn severity_letter(status: i32) -> char {
    match (-status) & 0x7 {
        WARNING => 'W',
        ERROR => 'E',
        FATAL => 'F',
        1 => 'S',
        _ => 'I',
    }
}

/// Formats the full message for `status` without argument substitution.
///
/// Returns `None` for statuses absent from the table.
pub fn message(status: i32) -> Option<String> {
    let msg = lookup(status)?;
    Some(format!(
        "%TKV-{}-{}, {}",
        severity_letter(msg.status),
        msg.mnemonic,
        msg.text
    ))
}

/// Formats the error string the engine writes into `errstr` after a failure.
///
/// The layout is `<code>,(<entry>),<message>[: <detail>]` where `<code>` is
/// the absolute status value.
pub fn format_errstr(status: i32, entry: &str, detail: &str) -> String {
    let body = message(status).unwrap_or_else(|| format!("%TKV-E-UNKNOWN, status {status}"));
    if detail.is_empty() {
        format!("{},({entry}),{body}", status.unsigned_abs())
    } else {
        format!("{},({entry}),{body}: {detail}", status.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_negative_and_distinct() {
        let mut seen = std::collections::HashSet::new();
        for m in MESSAGES {
            assert!(is_error(m.status), "{} should be negative", m.mnemonic);
            assert!(seen.insert(m.status), "{} is duplicated", m.mnemonic);
        }
    }

    #[test]
    fn special_codes_are_positive() {
        for code in [TP_RESTART, TP_ROLLBACK, NOTOK, LOCK_TIMEOUT] {
            assert!(code > 0);
            assert!(message(code).is_none());
            assert!(mnemonic(code).is_some());
        }
    }

    #[test]
    fn message_ignores_sign() {
        assert_eq!(message(GVUNDEF), message(-GVUNDEF));
        assert_eq!(mnemonic(-LVUNDEF), Some("LVUNDEF"));
    }

    #[test]
    fn errstr_layout() {
        let s = format_errstr(LVUNDEF, "get", "x");
        let mut parts = s.splitn(3, ',');
        assert_eq!(parts.next(), Some(LVUNDEF.unsigned_abs().to_string().as_str()));
        assert_eq!(parts.next(), Some("(get)"));
        assert_eq!(parts.next(), Some("%TKV-E-LVUNDEF, Undefined local variable: x"));
    }

    #[test]
    fn nodeend_is_warning() {
        assert!(message(NODEEND).unwrap().starts_with("%TKV-W-"));
        assert!(message(CALLINAFTERXIT).unwrap().starts_with("%TKV-F-"));
    }
}
