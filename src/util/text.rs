use std::borrow::Cow;

use chrono::DateTime;

/// Decodes HTML entities in feed-supplied text.
///
/// Feeds routinely double-encode titles (`&amp;#8217;`, `&amp;amp;`), so this
/// handles the XML builtins, a few common named entities, and numeric
/// references. Unknown entities are passed through literally rather than
/// dropped. Returns `Cow::Borrowed` when the input contains no `&` at all,
/// which is the overwhelmingly common case.
pub fn decode_entities(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        // Entities are short; stop scanning for the terminator after a few
        // characters. Walking char_indices keeps the cut on a boundary even
        // when multibyte text follows the ampersand.
        let semi = rest
            .char_indices()
            .take(12)
            .find(|&(_, c)| c == ';')
            .map(|(i, _)| i);
        let Some(semi) = semi else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };

        let entity = &rest[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => decode_numeric_entity(entity),
        };

        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn decode_numeric_entity(entity: &str) -> Option<char> {
    let body = entity.strip_prefix('#')?;
    let code = if let Some(hex) = body.strip_prefix('x').or_else(|| body.strip_prefix('X')) {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        body.parse::<u32>().ok()?
    };
    char::from_u32(code)
}

/// Decodes entities and trims whitespace; empty results become `None`.
pub fn clean_text(s: Option<String>) -> Option<String> {
    let s = s?;
    let cleaned = decode_entities(&s);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// Finds the first `<img src="...">` URL inside an HTML fragment.
///
/// A plain scan rather than a DOM parse: feed item bodies are small and
/// frequently malformed, and a missing thumbnail is a valid outcome.
pub fn first_img_src(html: &str) -> Option<String> {
    let mut rest = html;
    while let Some(tag) = rest.find("<img") {
        let after = &rest[tag..];
        let end = after.find('>').unwrap_or(after.len());
        let tag_body = &after[..end];

        if let Some(src) = attr_value(tag_body, "src") {
            if !src.is_empty() {
                return Some(src);
            }
        }
        if end >= after.len() {
            return None;
        }
        rest = &after[end + 1..];
    }
    None
}

/// Extracts an Open Graph image URL from a full HTML page.
///
/// Looks for `<meta property="og:image" content="...">` (either attribute
/// order). Best-effort by design.
pub fn og_image_from_html(html: &str) -> Option<String> {
    let mut rest = html;
    while let Some(pos) = rest.find("<meta") {
        let after = &rest[pos..];
        let end = after.find('>').unwrap_or(after.len());
        let tag = &after[..end];

        let is_og_image = attr_value(tag, "property")
            .or_else(|| attr_value(tag, "name"))
            .map(|p| p == "og:image")
            .unwrap_or(false);
        if is_og_image {
            if let Some(content) = attr_value(tag, "content") {
                if !content.is_empty() {
                    return Some(content);
                }
            }
        }
        if end >= after.len() {
            return None;
        }
        rest = &after[end + 1..];
    }
    None
}

/// Pulls a quoted attribute value out of a single tag body.
fn attr_value(tag: &str, name: &str) -> Option<String> {
    let mut search = tag;
    loop {
        let at = search.find(name)?;
        let after_name = &search[at + name.len()..];
        let after_eq = after_name.trim_start();
        let Some(after_eq) = after_eq.strip_prefix('=') else {
            search = &search[at + name.len()..];
            continue;
        };
        let after_eq = after_eq.trim_start();
        let quote = after_eq.chars().next()?;
        if quote != '"' && quote != '\'' {
            search = &search[at + name.len()..];
            continue;
        }
        let value = &after_eq[1..];
        let close = value.find(quote)?;
        return Some(value[..close].to_owned());
    }
}

/// Parses an author-supplied timestamp string into epoch milliseconds.
///
/// Feed timestamps are untrusted free-form text; RFC 3339 and RFC 2822 cover
/// the overwhelming majority, with two naive fallbacks for sloppy generators.
/// Unparseable input yields `None`, never an error.
pub fn parse_timestamp_ms(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_named_and_numeric_entities() {
        assert_eq!(decode_entities("a &amp; b"), "a & b");
        assert_eq!(decode_entities("&lt;tag&gt;"), "<tag>");
        assert_eq!(decode_entities("it&#8217;s"), "it\u{2019}s");
        assert_eq!(decode_entities("&#x27;quoted&#x27;"), "'quoted'");
    }

    #[test]
    fn unknown_entities_pass_through() {
        assert_eq!(decode_entities("&bogus; &"), "&bogus; &");
    }

    #[test]
    fn multibyte_text_after_ampersand_is_untouched() {
        // The terminator scan must not cut inside a multibyte character
        let input = "&0123456789étag";
        assert_eq!(decode_entities(input), input);
        assert_eq!(decode_entities("caf\u{e9} &amp; th\u{e9}"), "café & thé");
    }

    #[test]
    fn borrowed_when_no_entities() {
        assert!(matches!(decode_entities("plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn clean_text_trims_and_drops_empty() {
        assert_eq!(clean_text(Some("  hi  ".into())), Some("hi".into()));
        assert_eq!(clean_text(Some("   ".into())), None);
        assert_eq!(clean_text(None), None);
    }

    #[test]
    fn finds_first_img_src() {
        let html = r#"<p>text</p><img class="x" src="https://a.com/1.png"><img src="https://a.com/2.png">"#;
        assert_eq!(first_img_src(html), Some("https://a.com/1.png".to_string()));
    }

    #[test]
    fn no_img_yields_none() {
        assert_eq!(first_img_src("<p>no images here</p>"), None);
    }

    #[test]
    fn og_image_both_attribute_orders() {
        let a = r#"<head><meta property="og:image" content="https://x.com/a.jpg"></head>"#;
        let b = r#"<head><meta content="https://x.com/b.jpg" property="og:image"/></head>"#;
        assert_eq!(og_image_from_html(a), Some("https://x.com/a.jpg".into()));
        assert_eq!(og_image_from_html(b), Some("https://x.com/b.jpg".into()));
    }

    #[test]
    fn parses_rfc3339_and_rfc2822() {
        assert_eq!(
            parse_timestamp_ms("2024-01-15T10:00:00Z"),
            Some(1705312800000)
        );
        assert!(parse_timestamp_ms("Mon, 15 Jan 2024 10:00:00 GMT").is_some());
        assert_eq!(parse_timestamp_ms("not a date"), None);
        assert_eq!(parse_timestamp_ms(""), None);
    }
}
