use std::time::Duration;
use tl_recon::http::prober::{ProbeConfig, Prober};
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn config(targets: Vec<String>) -> ProbeConfig {
    ProbeConfig {
        targets,
        timeout: Duration::from_secs(5),
        retries: 0,
        ..ProbeConfig::default()
    }
}

#[tokio::test]
async fn test_probe_extracts_title_server_and_technologies() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Server", "nginx/1.25.3")
                .insert_header("X-Powered-By", "PHP/8.2")
                .set_body_raw(
                    "<html><head><title> Admin Console </title></head><body><script src=\"/js/jquery.min.js\"></script></body></html>",
                    "text/html",
                ),
        )
        .mount(&mock_server)
        .await;

    let prober = Prober::new(config(vec![mock_server.uri()])).unwrap();
    let results = prober.probe().await.unwrap();

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.status_code, 200);
    assert_eq!(result.title, "Admin Console");
    assert_eq!(result.server, "nginx/1.25.3");
    assert!(result.content_type.contains("text/html"));
    assert!(result.technologies.contains(&"Nginx".to_string()));
    assert!(result.technologies.contains(&"PHP".to_string()));
    assert!(result.technologies.contains(&"jQuery".to_string()));
    assert!(!result.redirected);
    assert!(result.final_url.is_empty());
    assert!(result.analysis.is_none());
}

#[tokio::test]
async fn test_probe_follows_redirect() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", format!("{}/new", mock_server.uri()).as_str()))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<title>New</title>", "text/html"))
        .mount(&mock_server)
        .await;

    let prober = Prober::new(config(vec![format!("{}/old", mock_server.uri())])).unwrap();
    let results = prober.probe().await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status_code, 200);
    assert!(results[0].redirected);
    assert!(results[0].final_url.ends_with("/new"));
    assert_eq!(results[0].title, "New");
}

#[tokio::test]
async fn test_probe_without_following_redirects() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new"))
        .mount(&mock_server)
        .await;

    let prober = Prober::new(ProbeConfig {
        follow_redirects: false,
        ..config(vec![format!("{}/old", mock_server.uri())])
    })
    .unwrap();
    let results = prober.probe().await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status_code, 302);
    assert!(!results[0].redirected);
    assert_eq!(results[0].headers.get("Location").map(String::as_str), Some("/new"));
}

#[tokio::test]
async fn test_bare_host_falls_back_to_http() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain"))
        .mount(&mock_server)
        .await;

    let host = mock_server.uri().trim_start_matches("http://").to_string();
    let prober = Prober::new(config(vec![host.clone()])).unwrap();
    let results = prober.probe().await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].url, format!("http://{}", host));
}

#[tokio::test]
async fn test_custom_headers_are_sent() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(header("X-Token", "secret"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let prober = Prober::new(ProbeConfig {
        headers: vec![("X-Token".to_string(), "secret".to_string())],
        ..config(vec![mock_server.uri()])
    })
    .unwrap();
    let results = prober.probe().await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status_code, 204);
}

#[tokio::test]
async fn test_unreachable_targets_are_excluded() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let prober = Prober::new(config(vec![
        mock_server.uri(),
        "http://127.0.0.1:1".to_string(),
        "   ".to_string(),
    ]))
    .unwrap();
    let results = prober.probe().await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status_code, 404);
    assert!(results[0].is_alive());
}

#[tokio::test]
async fn test_title_beyond_probe_body_cap_is_ignored() {
    let mock_server = MockServer::start().await;

    let body = format!("{}<title>Too Late</title>", " ".repeat(150 * 1024));
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/html"))
        .mount(&mock_server)
        .await;

    let prober = Prober::new(config(vec![mock_server.uri()])).unwrap();
    let results = prober.probe().await.unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].title.is_empty());
}

#[tokio::test]
async fn test_analyze_attaches_analysis() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Frame-Options", "DENY")
                .set_body_raw(
                    r#"<html><title>Shop</title><!-- TODO: remove debug user --><a href="mailto:ops@example.com">ops@example.com</a></html>"#,
                    "text/html",
                ),
        )
        .mount(&mock_server)
        .await;

    let prober = Prober::new(ProbeConfig {
        analyze: true,
        ..config(vec![mock_server.uri()])
    })
    .unwrap();
    let results = prober.probe().await.unwrap();

    let analysis = results[0].analysis.as_ref().unwrap();
    assert_eq!(analysis.title, "Shop");
    assert_eq!(analysis.security_headers.missing_count, 3);
    assert!(analysis.emails.contains(&"ops@example.com".to_string()));
    assert_eq!(analysis.hash.len(), 64);
}
