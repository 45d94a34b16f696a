//! Session ids and the backend index they carry.
//!
//! A backend that creates a session writes its own index into the first
//! character of the id, using a 64-character alphabet. Routing on that
//! character sends the session's later requests back to its owner.

use hmux_common::RequestAttributes;

/// Cookie holding the session id.
pub const DEFAULT_SESSION_COOKIE: &str = "JSESSIONID";

/// URL path parameter holding the session id when cookies are off.
pub const DEFAULT_SESSION_URL_PREFIX: &str = ";jsessionid=";

/// Finds the session id of a request.
///
/// Cookies win over the URL: every `Cookie` header is searched for
/// `cookie_name` first, then the URI for `url_prefix`. Empty values count as
/// no session.
///
/// # Example
///
/// ```rust
/// use hmux_balancer::session::session_id;
/// use hmux_common::RequestAttributes;
///
/// let request = RequestAttributes::new("GET", "/cart;jsessionid=bQx81");
/// assert_eq!(session_id(&request, "JSESSIONID", ";jsessionid="), Some("bQx81"));
/// ```
pub fn session_id<'a>(
    request: &'a RequestAttributes,
    cookie_name: &str,
    url_prefix: &str,
) -> Option<&'a str> {
    let from_cookie = request
        .headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("Cookie"))
        .flat_map(|(_, value)| value.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name.trim() == cookie_name && !value.is_empty()).then_some(value.trim())
        });
    if from_cookie.is_some() {
        return from_cookie;
    }

    if url_prefix.is_empty() {
        return None;
    }
    let start = request.uri.find(url_prefix)? + url_prefix.len();
    let rest = &request.uri[start..];
    let end = rest
        .find(|c: char| matches!(c, ';' | '?' | '/'))
        .unwrap_or(rest.len());
    let id = &rest[..end];
    (!id.is_empty()).then_some(id)
}

/// Backend index encoded in the first character of a session id, or `None`
/// when the id is empty or starts outside the alphabet.
pub fn decode_session_index(session_id: &str) -> Option<usize> {
    let code = match session_id.bytes().next()? {
        c @ b'a'..=b'z' => c - b'a',
        c @ b'A'..=b'Z' => c - b'A' + 26,
        c @ b'0'..=b'9' => c - b'0' + 52,
        b'_' => 62,
        b'-' => 63,
        _ => return None,
    };
    Some(code as usize)
}
