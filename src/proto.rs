//! Stateless classification of PostgreSQL v3 frontend messages.
//!
//! This is not a protocol parser: it recognizes exactly the two frame shapes the proxy
//! cares about (the SSL negotiation request and the Simple Query message) and otherwise
//! treats everything as opaque bytes to forward verbatim.

/// Message tag byte for the PostgreSQL v3 Simple Query message (`'Q' <int32 len> <cstring>`).
pub const QUERY_TAG: u8 = b'Q';

/// The length field value and the protocol code of `SSLRequest`: `int32(8) int32(80877103)`.
const SSL_REQUEST_LEN: i32 = 8;
const SSL_REQUEST_CODE: i32 = 80_877_103;

/// Single-byte reply the proxy sends to decline a TLS upgrade.
pub const SSL_DECLINE_REPLY: u8 = b'N';

/// True iff `buf` is exactly the 8-byte `SSLRequest` startup message: `int32(8) int32(80877103)`.
/// The first 4 bytes are the declared message length; this proxy doesn't separately verify it
/// beyond requiring `len(buf) == 8`.
pub fn is_ssl_request(buf: &[u8]) -> bool {
    if buf.len() != 8 {
        return false;
    }
    let code = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    code == SSL_REQUEST_CODE && i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) == SSL_REQUEST_LEN
}

/// True iff `buf` begins with the Simple Query tag byte `'Q'`.
pub fn is_query_frame(buf: &[u8]) -> bool {
    matches!(buf.first(), Some(&tag) if tag == QUERY_TAG)
}

/// Extracts the SQL text from a Simple Query frame (`'Q' <int32 len> <cstring>`): the tag and
/// length prefix are stripped, and the trailing NUL terminator is dropped if present. If `buf`
/// is shorter than the declared length (the frame arrived split across receive chunks), logs
/// whatever payload is actually present rather than dropping the line, matching the original's
/// unconditional `request.substr(5)` logging. Returns `None` only if there's no tag/length
/// prefix at all, or the payload present isn't valid UTF-8.
pub fn extract_sql_text(buf: &[u8]) -> Option<&str> {
    if !is_query_frame(buf) || buf.len() < 5 {
        return None;
    }
    let declared_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if declared_len < 4 {
        return None;
    }
    // declared_len counts itself (4 bytes) plus the cstring payload, but not the tag byte.
    // Clamp to what's actually present: a frame split across chunks still gets logged.
    let end = (1 + declared_len).min(buf.len());
    let mut payload = &buf[5..end];
    if payload.last() == Some(&0) {
        payload = &payload[..payload.len() - 1];
    }
    std::str::from_utf8(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_ssl_request() {
        let buf = [0x00, 0x00, 0x00, 0x08, 0x04, 0xD2, 0x16, 0x2F];
        assert!(is_ssl_request(&buf));
    }

    #[test]
    fn rejects_wrong_length() {
        let buf = [0x00, 0x00, 0x00, 0x08, 0x04, 0xD2, 0x16, 0x2F, 0x00];
        assert!(!is_ssl_request(&buf));
    }

    #[test]
    fn rejects_wrong_code() {
        let buf = [0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00];
        assert!(!is_ssl_request(&buf));
    }

    #[test]
    fn query_tag_detected() {
        assert!(is_query_frame(b"Qwhatever"));
        assert!(!is_query_frame(b"Parse"));
        assert!(!is_query_frame(b""));
    }

    #[test]
    fn extracts_select_1() {
        // 'Q' 00 00 00 0E S E L E C T ' ' 1 ; \0
        let buf: &[u8] = &[
            0x51, 0x00, 0x00, 0x00, 0x0E, b'S', b'E', b'L', b'E', b'C', b'T', b' ', b'1', b';', 0x00,
        ];
        assert_eq!(extract_sql_text(buf), Some("SELECT 1;"));
    }

    #[test]
    fn extract_returns_none_for_parse_message() {
        let buf: &[u8] = &[0x50, 0x00, 0x00, 0x00, 0x05, 0x00];
        assert_eq!(extract_sql_text(buf), None);
    }

    #[test]
    fn extract_logs_partial_payload_for_truncated_frame() {
        // declared_len is 0xFF but only one payload byte actually arrived in this chunk.
        let buf: &[u8] = &[0x51, 0x00, 0x00, 0x00, 0xFF, b'x'];
        assert_eq!(extract_sql_text(buf), Some("x"));
    }

    #[test]
    fn extract_handles_missing_trailing_nul() {
        let buf: &[u8] = &[0x51, 0x00, 0x00, 0x00, 0x08, b'a', b'b', b'c'];
        assert_eq!(extract_sql_text(buf), Some("abc"));
    }
}
