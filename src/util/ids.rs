use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Derives a stable, URL-safe identifier from a raw upstream identifier.
///
/// The same input always yields the same output, so feeds keyed by URL and
/// articles keyed by guid/link get idempotent upserts for free. The encoding
/// is base64url without padding: no `+`, `/`, or trailing `=`, safe to embed
/// in paths and query strings.
pub fn derive_id(raw: &str) -> String {
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Removes duplicate items by id, keeping the first occurrence.
///
/// Source order is preserved for the survivors. Used both inside the parser
/// (a single feed repeating a guid) and by the sync engine (the cross-feed
/// new-article batch before persistence).
pub fn dedupe_by_id<T, F>(items: Vec<T>, id_of: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(id_of(item).to_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn derive_id_is_deterministic() {
        let a = derive_id("https://example.com/feed.xml");
        let b = derive_id("https://example.com/feed.xml");
        assert_eq!(a, b);
    }

    #[test]
    fn derive_id_distinguishes_inputs() {
        assert_ne!(
            derive_id("https://example.com/a"),
            derive_id("https://example.com/b")
        );
    }

    #[test]
    fn derive_id_is_url_safe() {
        // A payload whose standard base64 encoding would contain '+' and '/'
        let id = derive_id("\u{fb}\u{ff}\u{fe}??>>~~");
        assert!(!id.contains('+'), "id contains '+': {}", id);
        assert!(!id.contains('/'), "id contains '/': {}", id);
        assert!(!id.ends_with('='), "id has padding: {}", id);
    }

    #[test]
    fn dedupe_keeps_first_occurrence_in_order() {
        struct Item {
            id: &'static str,
            v: u32,
        }
        let items = vec![
            Item { id: "a", v: 1 },
            Item { id: "b", v: 2 },
            Item { id: "a", v: 3 },
        ];
        let out = dedupe_by_id(items, |i| i.id);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "a");
        assert_eq!(out[0].v, 1);
        assert_eq!(out[1].id, "b");
        assert_eq!(out[1].v, 2);
    }

    proptest::proptest! {
        #[test]
        fn derive_id_never_emits_unsafe_chars(raw in ".*") {
            let id = derive_id(&raw);
            proptest::prop_assert!(!id.contains('+'));
            proptest::prop_assert!(!id.contains('/'));
            proptest::prop_assert!(!id.contains('='));
        }
    }
}
