//! Case-insensitive header-name matching helpers.
//!
//! Carried from the HTTP library this engine grew out of; extended with
//! the `JPIP-*` response header names used by `primary::process_reply`.

#[inline(always)]
fn eq_ignore_case(val: &str, name: &str) -> bool {
    val.len() == name.len()
        && val.bytes().zip(name.bytes())
            .all(|(a, b)| a.to_ascii_lowercase() == b.to_ascii_lowercase())
}

#[inline(always)]
pub fn is_transfer_encoding(val: &str) -> bool {
    eq_ignore_case(val, "transfer-encoding")
}

#[inline(always)]
pub fn is_content_length(val: &str) -> bool {
    eq_ignore_case(val, "content-length")
}

#[inline(always)]
pub fn is_connection(val: &str) -> bool {
    eq_ignore_case(val, "connection")
}

#[inline(always)]
pub fn is_content_type(val: &str) -> bool {
    eq_ignore_case(val, "content-type")
}

/// Matches a `JPIP-Foo` header name against its bare suffix `Foo`
/// (case-insensitively), stripping the common prefix first.
pub fn jpip_field(name: &str, suffix: &str) -> bool {
    name.len() == suffix.len() + 5
        && name[..5].eq_ignore_ascii_case("jpip-")
        && name[5..].eq_ignore_ascii_case(suffix)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_content_len() {
        assert!(is_content_length("Content-Length"));
        assert!(is_content_length("content-length"));
        assert!(is_content_length("CONTENT-LENGTH"));
    }

    #[test]
    fn test_transfer_encoding() {
        assert!(is_transfer_encoding("Transfer-Encoding"));
        assert!(is_transfer_encoding("TRANSFER-Encoding"));
    }

    #[test]
    fn test_jpip_field() {
        assert!(jpip_field("JPIP-cnew", "cnew"));
        assert!(jpip_field("jpip-TID", "tid"));
        assert!(!jpip_field("JPIP-cnews", "cnew"));
    }
}
