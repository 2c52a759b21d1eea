//! Typed message arguments and the type-signature alphabet.
//!
//! The wire-level marshaller lives outside this crate; handlers exchange
//! structured [`MsgArg`] values, and *unmarshalling* here means checking a
//! message's argument list against a member's declared signature before the
//! handler sees it.
//!
//! Signature alphabet: `b` boolean, `y` byte, `n`/`q` int16/uint16, `i`/`u`
//! int32/uint32, `x`/`t` int64/uint64, `d` double, `s` string, `o` object
//! path, `g` signature, `h` handle, `a` array, `(…)` struct, `{…}` dict
//! entry, `v` variant.

use meshbus_core::status::Status;

/// Maximum nesting depth a signature may carry.
const MAX_NESTING: usize = 32;

/// A typed message argument.
#[derive(Debug, Clone, PartialEq)]
pub enum MsgArg {
    /// `b`
    Boolean(bool),
    /// `y`
    Byte(u8),
    /// `n`
    Int16(i16),
    /// `q`
    Uint16(u16),
    /// `i`
    Int32(i32),
    /// `u`
    Uint32(u32),
    /// `x`
    Int64(i64),
    /// `t`
    Uint64(u64),
    /// `d`
    Double(f64),
    /// `s`
    String(String),
    /// `o`
    ObjectPath(String),
    /// `g`
    Signature(String),
    /// `h` — a socket handle reference.
    Handle(u64),
    /// `a` — element signature plus elements (the signature makes empty
    /// arrays well-typed).
    Array(String, Vec<MsgArg>),
    /// `(…)`
    Struct(Vec<MsgArg>),
    /// `{…}` — key/value dict entry.
    DictEntry(Box<MsgArg>, Box<MsgArg>),
    /// `v`
    Variant(Box<MsgArg>),
}

impl MsgArg {
    /// The signature of this value.
    #[must_use]
    pub fn signature(&self) -> String {
        match self {
            Self::Boolean(_) => "b".to_string(),
            Self::Byte(_) => "y".to_string(),
            Self::Int16(_) => "n".to_string(),
            Self::Uint16(_) => "q".to_string(),
            Self::Int32(_) => "i".to_string(),
            Self::Uint32(_) => "u".to_string(),
            Self::Int64(_) => "x".to_string(),
            Self::Uint64(_) => "t".to_string(),
            Self::Double(_) => "d".to_string(),
            Self::String(_) => "s".to_string(),
            Self::ObjectPath(_) => "o".to_string(),
            Self::Signature(_) => "g".to_string(),
            Self::Handle(_) => "h".to_string(),
            Self::Array(elem, _) => format!("a{elem}"),
            Self::Struct(fields) => {
                let inner: String = fields.iter().map(|f| f.signature()).collect();
                format!("({inner})")
            }
            Self::DictEntry(key, value) => {
                format!("{{{}{}}}", key.signature(), value.signature())
            }
            Self::Variant(_) => "v".to_string(),
        }
    }

    /// Reads a boolean value.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Reads a uint16 value.
    #[must_use]
    pub const fn as_u16(&self) -> Option<u16> {
        match self {
            Self::Uint16(v) => Some(*v),
            _ => None,
        }
    }

    /// Reads a uint32 value.
    #[must_use]
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Uint32(v) => Some(*v),
            _ => None,
        }
    }

    /// Reads a string, object-path, or signature value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::ObjectPath(s) | Self::Signature(s) => Some(s),
            _ => None,
        }
    }

    /// Reads array elements.
    #[must_use]
    pub fn as_array(&self) -> Option<&[MsgArg]> {
        match self {
            Self::Array(_, elems) => Some(elems),
            _ => None,
        }
    }

    /// Unwraps a variant one level.
    #[must_use]
    pub fn as_variant(&self) -> Option<&MsgArg> {
        match self {
            Self::Variant(inner) => Some(inner),
            _ => None,
        }
    }
}

/// Concatenated signature of an argument list.
#[must_use]
pub fn args_signature(args: &[MsgArg]) -> String {
    args.iter().map(MsgArg::signature).collect()
}

/// Validates a complete signature string.
#[must_use]
pub fn is_valid_signature(sig: &str) -> bool {
    let bytes = sig.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        match consume_single(bytes, pos, 0) {
            Some(next) => pos = next,
            None => return false,
        }
    }
    true
}

/// Consumes one complete type starting at `pos`, returning the next offset.
fn consume_single(bytes: &[u8], pos: usize, depth: usize) -> Option<usize> {
    if depth > MAX_NESTING {
        return None;
    }
    match *bytes.get(pos)? {
        b'b' | b'y' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g'
        | b'h' | b'v' => Some(pos + 1),
        b'a' => consume_single(bytes, pos + 1, depth + 1),
        b'(' => {
            let mut cursor = pos + 1;
            while *bytes.get(cursor)? != b')' {
                cursor = consume_single(bytes, cursor, depth + 1)?;
            }
            Some(cursor + 1)
        }
        b'{' => {
            let key_end = consume_single(bytes, pos + 1, depth + 1)?;
            let value_end = consume_single(bytes, key_end, depth + 1)?;
            if *bytes.get(value_end)? != b'}' {
                return None;
            }
            Some(value_end + 1)
        }
        _ => None,
    }
}

/// Checks an argument list against a declared signature.
///
/// The wildcard signature `*` accepts any argument list. Otherwise the
/// derived signature must equal the declared one.
///
/// # Errors
///
/// Returns [`Status::InvalidData`] on mismatch or a malformed declared
/// signature.
pub fn unmarshal_check(args: &[MsgArg], declared: &str) -> Result<(), Status> {
    if declared == "*" {
        return Ok(());
    }
    if !is_valid_signature(declared) {
        return Err(Status::InvalidData);
    }
    if args_signature(args) != declared {
        return Err(Status::InvalidData);
    }
    Ok(())
}

/// Convenience constructor for an `a{sv}` dictionary.
#[must_use]
pub fn dict_sv(entries: Vec<(&str, MsgArg)>) -> MsgArg {
    MsgArg::Array(
        "{sv}".to_string(),
        entries
            .into_iter()
            .map(|(k, v)| {
                MsgArg::DictEntry(
                    Box::new(MsgArg::String(k.to_string())),
                    Box::new(MsgArg::Variant(Box::new(v))),
                )
            })
            .collect(),
    )
}

/// Looks up a key in an `a{sv}` dictionary.
#[must_use]
pub fn dict_get<'a>(dict: &'a MsgArg, key: &str) -> Option<&'a MsgArg> {
    for entry in dict.as_array()? {
        if let MsgArg::DictEntry(k, v) = entry {
            if k.as_str() == Some(key) {
                return v.as_variant().or(Some(v));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_signatures() {
        assert_eq!(MsgArg::Boolean(true).signature(), "b");
        assert_eq!(MsgArg::Uint32(1).signature(), "u");
        assert_eq!(MsgArg::String("x".into()).signature(), "s");
        assert_eq!(MsgArg::ObjectPath("/door".into()).signature(), "o");
        assert_eq!(
            MsgArg::Struct(vec![MsgArg::Uint16(1), MsgArg::String("a".into())]).signature(),
            "(qs)"
        );
    }

    #[test]
    fn test_empty_array_keeps_element_signature() {
        let arg = MsgArg::Array("s".to_string(), vec![]);
        assert_eq!(arg.signature(), "as");
    }

    #[test]
    fn test_dict_signature() {
        let dict = dict_sv(vec![("multipoint", MsgArg::Boolean(true))]);
        assert_eq!(dict.signature(), "a{sv}");
    }

    #[test]
    fn test_signature_validation() {
        for sig in ["", "b", "ay", "a{sv}", "(bqu)", "a(oas)", "v", "aav", "(a{sv}u)"] {
            assert!(is_valid_signature(sig), "{sig} should be valid");
        }
        for sig in ["z", "a", "(", "(b", "{sv}q}", "{s}", "a{s}", "{vvv}"] {
            assert!(!is_valid_signature(sig), "{sig} should be invalid");
        }
    }

    #[test]
    fn test_unmarshal_check() {
        let args = vec![MsgArg::String("door".into()), MsgArg::Uint32(4)];
        assert!(unmarshal_check(&args, "su").is_ok());
        assert!(unmarshal_check(&args, "*").is_ok());
        assert_eq!(unmarshal_check(&args, "us"), Err(Status::InvalidData));
        assert_eq!(unmarshal_check(&args, "s"), Err(Status::InvalidData));
        assert_eq!(unmarshal_check(&args, "#!"), Err(Status::InvalidData));
        assert!(unmarshal_check(&[], "").is_ok());
    }

    #[test]
    fn test_dict_get() {
        let dict = dict_sv(vec![
            ("traffic", MsgArg::Byte(1)),
            ("multipoint", MsgArg::Boolean(true)),
        ]);
        assert_eq!(dict_get(&dict, "multipoint").and_then(MsgArg::as_bool), Some(true));
        assert!(dict_get(&dict, "absent").is_none());
    }
}
