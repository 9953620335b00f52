//! Charset resolution for response bodies.
//!
//! The cascade is: `charset=` in the `Content-Type` header, then (when HTML
//! inspection is enabled) a `<meta>` declaration in the document head, then
//! the configured default. Unknown labels fall through to the next step.

use encoding_rs::{Encoding, WINDOWS_1252};
use scraper::{Html, Selector};

/// Extracts and resolves the `charset=` parameter of a content-type value.
pub fn charset_from_content_type(content_type: &str) -> Option<&'static Encoding> {
    let lowered = content_type.to_ascii_lowercase();
    let start = lowered.find("charset=")? + "charset=".len();
    let rest = content_type[start..].trim_start_matches(['"', '\'']);
    let label: String = rest
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ':' | '+' | '-'))
        .collect();
    if label.is_empty() {
        return None;
    }
    Encoding::for_label(label.as_bytes())
}

/// Looks for `<meta charset>` or `<meta http-equiv="Content-Type">` in the document head.
///
/// Meta elements are visited in order; the first one that declares a charset
/// either way decides, even if its label is unknown.
pub fn charset_from_html(body: &[u8]) -> Option<&'static Encoding> {
    // Single-byte decode keeps every ASCII tag intact whatever the real charset is.
    let (text, _) = WINDOWS_1252.decode_without_bom_handling(body);
    let document = Html::parse_document(&text);
    let Ok(selector) = Selector::parse("head meta") else {
        return None;
    };
    for meta in document.select(&selector) {
        let element = meta.value();
        if let Some(label) = element.attr("charset") {
            return Encoding::for_label(label.trim().as_bytes());
        }
        if element
            .attr("http-equiv")
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("content-type"))
        {
            return element.attr("content").and_then(charset_from_content_type);
        }
    }
    None
}

pub fn resolve_charset(
    content_type: Option<&str>,
    body: &[u8],
    inspect_html: bool,
    default: &'static Encoding,
) -> &'static Encoding {
    if let Some(encoding) = content_type.and_then(charset_from_content_type) {
        return encoding;
    }
    if inspect_html && let Some(encoding) = charset_from_html(body) {
        return encoding;
    }
    default
}

pub fn decode(body: &[u8], encoding: &'static Encoding) -> String {
    let (text, _) = encoding.decode_without_bom_handling(body);
    text.into_owned()
}
