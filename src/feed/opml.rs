use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::util::validate_url;

/// Maximum allowed nesting depth for OPML outline elements. Caps recursion on
/// maliciously nested documents.
const MAX_OPML_DEPTH: usize = 50;

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// A subscription extracted from an OPML file: one `<outline>` with an
/// `xmlUrl` attribute, plus the title of its nearest enclosing folder
/// outline, if any.
#[derive(Debug, Clone)]
pub struct OpmlFeed {
    /// From `title`, falling back to `text`, then to the XML URL itself.
    pub title: String,
    pub xml_url: String,
    pub html_url: Option<String>,
    /// Title of the enclosing non-feed outline (folder), innermost wins.
    pub folder: Option<String>,
}

/// Parses an OPML file from disk.
pub async fn parse(path: &str) -> Result<Vec<OpmlFeed>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path))?;
    parse_opml_content(&content)
}

/// Parses OPML content, extracting every outline with an `xmlUrl` attribute
/// regardless of nesting depth. Folder outlines (no `xmlUrl`) are tracked so
/// each feed records its enclosing folder title, but are not themselves
/// returned.
///
/// XXE is structurally mitigated: quick-xml 0.37 never parses `<!ENTITY>`
/// declarations, so only the five XML builtin entities resolve.
pub fn parse_opml_content(content: &str) -> Result<Vec<OpmlFeed>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut feeds = Vec::new();
    let mut buf = Vec::new();
    // Stack of enclosing folder outline titles; None for feed outlines so
    // End events pop symmetrically.
    let mut folder_stack: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if folder_stack.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH).into());
                }
                let outline = parse_outline_attributes(&e, &reader)?;
                match outline {
                    Outline::Feed(feed) => {
                        feeds.push(with_folder(feed, &folder_stack));
                        folder_stack.push(None);
                    }
                    Outline::Folder(title) => folder_stack.push(title),
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                if let Outline::Feed(feed) = parse_outline_attributes(&e, &reader)? {
                    feeds.push(with_folder(feed, &folder_stack));
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                folder_stack.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string()).into()),
            _ => {}
        }
        buf.clear();
    }

    Ok(feeds)
}

fn with_folder(mut feed: OpmlFeed, folder_stack: &[Option<String>]) -> OpmlFeed {
    feed.folder = folder_stack
        .iter()
        .rev()
        .find_map(|f| f.as_ref())
        .cloned();
    feed
}

enum Outline {
    Feed(OpmlFeed),
    Folder(Option<String>),
}

fn parse_outline_attributes(
    e: &quick_xml::events::BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Outline> {
    let mut xml_url = None;
    let mut html_url = None;
    let mut title = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let decoder = reader.decoder();
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"htmlUrl" => {
                let url_str = attr.decode_and_unescape_value(decoder)?;
                match validate_url(&url_str) {
                    Ok(_) => html_url = Some(url_str.to_string()),
                    Err(e) => {
                        tracing::warn!(url = %url_str, error = %e, "Ignoring invalid htmlUrl in OPML")
                    }
                }
            }
            b"title" => title = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"text" => {
                if title.is_none() {
                    title = Some(attr.decode_and_unescape_value(decoder)?.to_string())
                }
            }
            _ => {}
        }
    }

    match xml_url {
        Some(url) => match validate_url(&url) {
            Ok(_) => Ok(Outline::Feed(OpmlFeed {
                title: title.unwrap_or_else(|| url.clone()),
                xml_url: url,
                html_url,
                folder: None,
            })),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Skipping feed with unsafe URL");
                Ok(Outline::Folder(None))
            }
        },
        None => Ok(Outline::Folder(title)),
    }
}

// ============================================================================
// Export
// ============================================================================

/// The dated default export name, e.g. `quill-subscriptions-20240115.opml`.
pub fn export_filename() -> String {
    format!(
        "quill-subscriptions-{}.opml",
        chrono::Utc::now().format("%Y%m%d")
    )
}

/// Exports subscriptions as an OPML 2.0 document. Feeds that share a folder
/// title are grouped under one folder outline; folderless feeds sit directly
/// in the body.
pub fn export_opml(feeds: &[OpmlFeed]) -> Result<String> {
    use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
    use quick_xml::Writer;
    use std::io::Cursor;

    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer
        .write_event(Event::Start(opml))
        .context("Failed to write opml element")?;

    writer
        .write_event(Event::Start(BytesStart::new("head")))
        .context("Failed to write head element")?;
    writer
        .write_event(Event::Start(BytesStart::new("title")))
        .context("Failed to write title element")?;
    writer
        .write_event(Event::Text(BytesText::new("quill subscriptions")))
        .context("Failed to write title text")?;
    writer
        .write_event(Event::End(BytesEnd::new("title")))
        .context("Failed to write title end")?;
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .context("Failed to write head end")?;

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .context("Failed to write body element")?;

    let write_feed = |writer: &mut Writer<Cursor<Vec<u8>>>, feed: &OpmlFeed| -> Result<()> {
        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("type", "rss"));
        outline.push_attribute(("text", feed.title.as_str()));
        outline.push_attribute(("title", feed.title.as_str()));
        outline.push_attribute(("xmlUrl", feed.xml_url.as_str()));
        if let Some(ref html_url) = feed.html_url {
            outline.push_attribute(("htmlUrl", html_url.as_str()));
        }
        writer
            .write_event(Event::Empty(outline))
            .context("Failed to write outline element")
    };

    // Folderless feeds first, then one folder outline per distinct title in
    // first-appearance order.
    for feed in feeds.iter().filter(|f| f.folder.is_none()) {
        write_feed(&mut writer, feed)?;
    }
    let mut seen_folders: Vec<&str> = Vec::new();
    for feed in feeds {
        let Some(folder) = feed.folder.as_deref() else {
            continue;
        };
        if seen_folders.contains(&folder) {
            continue;
        }
        seen_folders.push(folder);

        let mut group = BytesStart::new("outline");
        group.push_attribute(("text", folder));
        group.push_attribute(("title", folder));
        writer
            .write_event(Event::Start(group))
            .context("Failed to write folder outline")?;
        for member in feeds.iter().filter(|f| f.folder.as_deref() == Some(folder)) {
            write_feed(&mut writer, member)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("outline")))
            .context("Failed to write folder outline end")?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .context("Failed to write body end")?;
    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .context("Failed to write opml end")?;

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).context("Generated OPML contains invalid UTF-8")
}

/// Writes the OPML export atomically: temp file in the destination directory,
/// sync, then rename.
pub fn export_to_file(feeds: &[OpmlFeed], path: &std::path::Path) -> Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let content = export_opml(feeds)?;

    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{:016x}", random_suffix));

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .with_context(|| {
            format!(
                "Failed to create temporary file '{}': check directory permissions",
                temp_path.display()
            )
        })?;

    std::io::Write::write_all(&mut file, content.as_bytes()).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to write OPML to temporary file '{}'",
            temp_path.display()
        )
    })?;

    file.sync_all().with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to sync temporary file '{}' to disk",
            temp_path.display()
        )
    })?;

    drop(file);

    std::fs::rename(&temp_path, path).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to rename '{}' to '{}'",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn nested_outlines_record_folder() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="2.0">
  <head><title>Test Feeds</title></head>
  <body>
    <outline type="rss" text="Loose" xmlUrl="https://loose.com/feed"/>
    <outline text="Blogs" title="Blogs">
      <outline type="rss" text="Example Blog" title="Example Blog" xmlUrl="https://example.com/feed.xml" htmlUrl="https://example.com"/>
      <outline type="rss" text="No HTML" title="No HTML" xmlUrl="https://nohtml.com/rss"/>
    </outline>
  </body>
</opml>"#;

        let feeds = parse_opml_content(content).unwrap();
        assert_eq!(feeds.len(), 3);

        assert_eq!(feeds[0].title, "Loose");
        assert_eq!(feeds[0].folder, None);

        assert_eq!(feeds[1].title, "Example Blog");
        assert_eq!(feeds[1].xml_url, "https://example.com/feed.xml");
        assert_eq!(feeds[1].html_url, Some("https://example.com".to_string()));
        assert_eq!(feeds[1].folder.as_deref(), Some("Blogs"));

        assert_eq!(feeds[2].folder.as_deref(), Some("Blogs"));
    }

    #[test]
    fn title_falls_back_to_text_then_url() {
        let content = r#"<?xml version="1.0"?>
<opml version="2.0">
  <body>
    <outline type="rss" text="Text Only" xmlUrl="https://textonly.com/feed"/>
    <outline type="rss" xmlUrl="https://notitle.com/feed"/>
  </body>
</opml>"#;

        let feeds = parse_opml_content(content).unwrap();
        assert_eq!(feeds[0].title, "Text Only");
        assert_eq!(feeds[1].title, "https://notitle.com/feed");
    }

    #[test]
    fn non_http_urls_skipped() {
        let content = r#"<?xml version="1.0"?>
    <opml version="2.0"><body>
        <outline xmlUrl="https://valid.com/feed"/>
        <outline xmlUrl="file:///etc/passwd"/>
        <outline xmlUrl="ftp://internal.server/feed"/>
    </body></opml>"#;

        let feeds = parse_opml_content(content).unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].xml_url, "https://valid.com/feed");
    }

    #[test]
    fn localhost_and_private_urls_skipped() {
        let content = r#"<?xml version="1.0"?>
    <opml version="2.0"><body>
        <outline xmlUrl="https://valid.com/feed"/>
        <outline xmlUrl="http://localhost:8080/feed"/>
        <outline xmlUrl="http://127.0.0.1/feed"/>
        <outline xmlUrl="http://192.168.1.10/feed"/>
        <outline xmlUrl="http://[fe80::1]/feed" htmlUrl="http://10.0.0.1/"/>
    </body></opml>"#;

        let feeds = parse_opml_content(content).unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].xml_url, "https://valid.com/feed");
    }

    #[test]
    fn malformed_xml_errors() {
        assert!(parse_opml_content("<not valid xml").is_err());
    }

    #[test]
    fn xxe_entities_do_not_expand() {
        let malicious = r#"<?xml version="1.0"?>
<!DOCTYPE opml [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<opml version="2.0">
    <body>
        <outline text="&xxe;" xmlUrl="https://example.com/feed.xml"/>
    </body>
</opml>"#;

        match parse_opml_content(malicious) {
            Ok(feeds) => {
                for feed in &feeds {
                    assert!(!feed.title.contains("root:"), "XXE expansion detected");
                }
            }
            Err(_) => {} // Rejection is also fine
        }
    }

    #[test]
    fn deeply_nested_opml_rejected() {
        let mut opml = String::from(r#"<?xml version="1.0"?><opml version="2.0"><body>"#);
        for _ in 0..100 {
            opml.push_str(r#"<outline text="level">"#);
        }
        for _ in 0..100 {
            opml.push_str("</outline>");
        }
        opml.push_str("</body></opml>");

        let result = parse_opml_content(&opml);
        assert!(result.is_err(), "Deeply nested OPML should be rejected");
    }

    #[test]
    fn export_groups_by_folder_and_round_trips() {
        let original = vec![
            OpmlFeed {
                title: "Loose".to_string(),
                xml_url: "https://loose.com/feed".to_string(),
                html_url: None,
                folder: None,
            },
            OpmlFeed {
                title: "Example Blog".to_string(),
                xml_url: "https://example.com/feed.xml".to_string(),
                html_url: Some("https://example.com".to_string()),
                folder: Some("Blogs".to_string()),
            },
            OpmlFeed {
                title: "No HTML Feed".to_string(),
                xml_url: "https://nohtml.com/rss".to_string(),
                html_url: None,
                folder: Some("Blogs".to_string()),
            },
        ];

        let exported = export_opml(&original).unwrap();
        let parsed = parse_opml_content(&exported).unwrap();

        assert_eq!(parsed.len(), original.len());
        for feed in &original {
            let round = parsed
                .iter()
                .find(|p| p.xml_url == feed.xml_url)
                .expect("feed survives round trip");
            assert_eq!(round.title, feed.title);
            assert_eq!(round.html_url, feed.html_url);
            assert_eq!(round.folder, feed.folder);
        }
    }

    #[test]
    fn export_escapes_xml_special_chars() {
        let feeds = vec![OpmlFeed {
            title: "Feed with <special> & \"chars\"".to_string(),
            xml_url: "https://example.com/feed?a=1&b=2".to_string(),
            html_url: None,
            folder: None,
        }];

        let exported = export_opml(&feeds).unwrap();
        let parsed = parse_opml_content(&exported).unwrap();

        assert_eq!(parsed[0].title, "Feed with <special> & \"chars\"");
        assert_eq!(parsed[0].xml_url, "https://example.com/feed?a=1&b=2");
    }

    #[test]
    fn export_filename_is_dated() {
        let name = export_filename();
        assert!(name.starts_with("quill-subscriptions-"));
        assert!(name.ends_with(".opml"));
    }

    #[test]
    fn export_to_file_is_readable() {
        let feeds = vec![OpmlFeed {
            title: "File Export Test".to_string(),
            xml_url: "https://example.com/feed.xml".to_string(),
            html_url: None,
            folder: None,
        }];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscriptions.opml");
        export_to_file(&feeds, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed = parse_opml_content(&content).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].title, "File Export Test");
    }
}
