use std::collections::HashSet;
use std::time::Duration;
use tl_recon::error::ScanError;
use tl_recon::http::crawler::{CrawlConfig, CrawlResult, Crawler};
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

async fn mount_html(server: &MockServer, route: &str, html: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(html.to_string(), "text/html"))
        .mount(server)
        .await;
}

fn config(start: String) -> CrawlConfig {
    CrawlConfig {
        start_urls: vec![start],
        timeout: Duration::from_secs(5),
        rate_limit: 1000.0,
        ..CrawlConfig::default()
    }
}

fn crawled(results: &[CrawlResult]) -> HashSet<String> {
    results
        .iter()
        .filter(|r| r.source == "crawl")
        .map(|r| r.url.clone())
        .collect()
}

#[tokio::test]
async fn test_crawler_follows_links_within_same_host() {
    let mock_server = MockServer::start().await;
    let base = mock_server.uri();

    mount_html(
        &mock_server,
        "/",
        r##"<a href="/a">A</a><a href="b">B</a><a href="http://outside.invalid/x">X</a>
           <a href="mailto:root@example.com">mail</a><a href="#top">top</a>"##,
    )
    .await;
    mount_html(&mock_server, "/a", r#"<a href="/">home</a><a href="/b">B</a>"#).await;
    mount_html(&mock_server, "/b", "<p>leaf</p>").await;

    let crawler = Crawler::new(CrawlConfig {
        same_host: true,
        ..config(format!("{}/", base))
    })
    .unwrap();
    let results = crawler.crawl().await.unwrap();

    let urls = crawled(&results);
    let expected: HashSet<String> = ["/", "/a", "/b"].iter().map(|p| format!("{}{}", base, p)).collect();
    assert_eq!(urls, expected);
    assert!(results.iter().all(|r| !r.url.contains("outside.invalid")));
    assert_eq!(results.iter().filter(|r| r.url == format!("{}/a", base)).count(), 1);

    let root = results.iter().find(|r| r.url == format!("{}/", base)).unwrap();
    assert_eq!(root.depth, 0);
    assert_eq!(root.kind, "page");
}

#[tokio::test]
async fn test_crawler_respects_max_depth() {
    let mock_server = MockServer::start().await;
    let base = mock_server.uri();

    mount_html(&mock_server, "/", r#"<a href="/level1">1</a>"#).await;
    mount_html(&mock_server, "/level1", r#"<a href="/level2">2</a>"#).await;
    mount_html(&mock_server, "/level2", r#"<a href="/level3">3</a>"#).await;

    let crawler = Crawler::new(CrawlConfig {
        max_depth: 1,
        ..config(format!("{}/", base))
    })
    .unwrap();
    let results = crawler.crawl().await.unwrap();

    let urls = crawled(&results);
    assert!(urls.contains(&format!("{}/level1", base)));
    assert!(!urls.contains(&format!("{}/level2", base)));
    assert!(results.iter().all(|r| r.depth <= 1));
}

#[tokio::test]
async fn test_crawler_respects_max_urls() {
    let mock_server = MockServer::start().await;
    let base = mock_server.uri();

    let links: String = (0..50).map(|i| format!(r#"<a href="/page{}">p</a>"#, i)).collect();
    mount_html(&mock_server, "/", &links).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<p>x</p>", "text/html"))
        .mount(&mock_server)
        .await;

    let crawler = Crawler::new(CrawlConfig {
        max_urls: 10,
        ..config(format!("{}/", base))
    })
    .unwrap();
    let results = crawler.crawl().await.unwrap();

    let urls = crawled(&results);
    assert!(!urls.is_empty());
    assert!(urls.len() <= 10, "crawled {} urls", urls.len());
}

#[tokio::test]
async fn test_crawler_extracts_forms_and_js_endpoints() {
    let mock_server = MockServer::start().await;
    let base = mock_server.uri();

    mount_html(
        &mock_server,
        "/",
        r#"<form action="/login" method="post">
               <input type="text" name="username"><input type="password" name="password">
           </form>
           <script>fetch("/api/users"); axios.get('/v1/orders');</script>"#,
    )
    .await;

    let crawler = Crawler::new(CrawlConfig {
        js_parse: true,
        ..config(format!("{}/", base))
    })
    .unwrap();
    let results = crawler.crawl().await.unwrap();

    let form = results.iter().find(|r| r.source == "form").unwrap();
    assert_eq!(form.url, format!("{}/login", base));
    assert_eq!(form.kind, "form");
    assert_eq!(form.method, "POST");
    assert_eq!(form.params, vec!["username", "password"]);

    let endpoints: HashSet<String> = results
        .iter()
        .filter(|r| r.source == "js-parse")
        .map(|r| r.url.clone())
        .collect();
    assert!(endpoints.contains(&format!("{}/api/users", base)));
    assert!(endpoints.contains(&format!("{}/v1/orders", base)));
    assert!(results.iter().filter(|r| r.source == "js-parse").all(|r| r.kind == "api"));
}

#[tokio::test]
async fn test_crawler_skips_non_html_bodies() {
    let mock_server = MockServer::start().await;
    let base = mock_server.uri();

    Mock::given(method("GET"))
        .and(path("/data.json"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(r#"{"next": "<a href=\"/hidden\">"}"#, "application/json"))
        .mount(&mock_server)
        .await;

    let crawler = Crawler::new(config(format!("{}/data.json", base))).unwrap();
    let results = crawler.crawl().await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].kind, "api");
}

#[tokio::test]
async fn test_crawler_cancelled_before_start() {
    let crawler = Crawler::new(config("http://127.0.0.1:1/".to_string())).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = crawler.crawl_with_cancel(&cancel).await.unwrap_err();
    assert!(matches!(err, ScanError::Cancelled));
}

#[tokio::test]
async fn test_crawler_unreachable_seed_finishes_empty() {
    let crawler = Crawler::new(config("http://127.0.0.1:1/".to_string())).unwrap();
    let results = tokio::time::timeout(Duration::from_secs(10), crawler.crawl())
        .await
        .unwrap()
        .unwrap();
    assert!(results.is_empty());
}
