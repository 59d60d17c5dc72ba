use std::time::Duration;

use crate::util::og_image_from_html;

const OG_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HTML_BYTES: usize = 512 * 1024;

/// Best-effort og:image lookup for an article that had no thumbnail in the
/// feed itself. A HEAD request checks the content type first; only HTML pages
/// get fetched and scraped. Every failure path (network, non-HTML content,
/// missing tag) resolves to `None`; this step must never fail a refresh.
pub async fn resolve_og_image(client: &reqwest::Client, link: &str) -> Option<String> {
    let head = tokio::time::timeout(OG_FETCH_TIMEOUT, client.head(link).send())
        .await
        .ok()?
        .ok()?;
    if !head.status().is_success() || !is_html(&head) {
        return None;
    }

    let response = tokio::time::timeout(OG_FETCH_TIMEOUT, client.get(link).send())
        .await
        .ok()?
        .ok()?;
    if !response.status().is_success() || !is_html(&response) {
        return None;
    }

    let html = read_capped(response).await?;
    og_image_from_html(&html)
}

fn is_html(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/html"))
        .unwrap_or(false)
}

/// Reads the body up to a fixed cap. og:image meta tags live in <head>, so a
/// truncated read is fine.
async fn read_capped(mut response: reqwest::Response) -> Option<String> {
    let mut bytes: Vec<u8> = Vec::new();
    while let Ok(Some(chunk)) = response.chunk().await {
        bytes.extend_from_slice(&chunk);
        if bytes.len() >= MAX_HTML_BYTES {
            bytes.truncate(MAX_HTML_BYTES);
            break;
        }
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const POST_HTML: &str =
        r#"<html><head><meta property="og:image" content="https://cdn.example.com/a.png"></head></html>"#;

    #[tokio::test]
    async fn extracts_og_image_from_html_page() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("", "text/html; charset=utf-8"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/post"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(POST_HTML, "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/post", server.uri());
        assert_eq!(
            resolve_og_image(&client, &url).await.as_deref(),
            Some("https://cdn.example.com/a.png")
        );
    }

    #[tokio::test]
    async fn non_html_head_short_circuits_without_get() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/image.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("", "image/jpeg"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/image.jpg"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        assert!(resolve_og_image(&client, &format!("{}/image.jpg", server.uri()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn errors_and_unreachable_hosts_yield_none() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        assert!(resolve_og_image(&client, &format!("{}/gone", server.uri()))
            .await
            .is_none());
        assert!(resolve_og_image(&client, "http://127.0.0.1:1/nope")
            .await
            .is_none());
    }
}
