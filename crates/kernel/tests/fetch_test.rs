//! Integration tests for the per-extension HTTP fetch client.
//!
//! ## Test Coverage
//! - Browser impersonation headers on the default client
//! - `noCloudflareBypass` opting out of impersonation
//! - Non-2xx statuses returned as unsuccessful responses, not errors
//! - Cookie and JSON body decoding
//! - Method normalization and JSON request bodies
//! - Multipart form bodies with a matching content type
//! - Redirect following with the `redirected` flag
//! - The per-extension in-flight request cap
//! - Request timeouts and pre-aborted signals

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::{Duration, Instant};

use ayame_kernel::error::HostError;
use ayame_kernel::host::{AbortContext, FetchBody, FetchClient, FetchOptions, FormData};
use ayame_kernel::scheduler::Scheduler;
use serde_json::json;
use tokio::runtime::Runtime;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn requests_carry_browser_headers_by_default() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let client = FetchClient::new("fetch-test").unwrap();
    let response = client
        .fetch(&format!("{}/page", server.uri()), FetchOptions::default())
        .await
        .unwrap();

    assert!(response.ok);
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "ok");

    let requests = server.received_requests().await.unwrap();
    let agent = requests[0]
        .headers
        .get("user-agent")
        .expect("the default client impersonates a browser")
        .to_str()
        .unwrap();
    assert!(agent.starts_with("Mozilla/5.0"), "got {agent:?}");
    assert!(agent.contains("Chrome/124"), "got {agent:?}");
    assert_eq!(
        requests[0].headers.get("accept-language").unwrap(),
        "en-US,en;q=0.9"
    );
}

#[tokio::test]
async fn the_bypass_opt_out_sends_no_browser_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = FetchClient::new("fetch-test").unwrap();
    client
        .fetch(
            &format!("{}/plain", server.uri()),
            FetchOptions {
                no_cloudflare_bypass: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("user-agent").is_none());
}

#[tokio::test]
async fn error_statuses_come_back_as_unsuccessful_responses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such episode"))
        .mount(&server)
        .await;

    let client = FetchClient::new("fetch-test").unwrap();
    let response = client
        .fetch(&format!("{}/missing", server.uri()), FetchOptions::default())
        .await
        .expect("a 404 is a response, not an error");

    assert!(!response.ok);
    assert_eq!(response.status, 404);
    assert_eq!(response.status_text, "404 Not Found");
    assert_eq!(response.text(), "no such episode");
}

#[tokio::test]
async fn cookies_and_json_bodies_are_decoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/session"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "sid=abc123; Path=/; HttpOnly")
                .set_body_json(json!({"episodes": 12})),
        )
        .mount(&server)
        .await;

    let client = FetchClient::new("fetch-test").unwrap();
    let response = client
        .fetch(&format!("{}/session", server.uri()), FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(response.json(), Some(json!({"episodes": 12})));
    assert_eq!(response.cookies.get("sid").map(String::as_str), Some("abc123"));
    assert!(response.content_type.starts_with("application/json"));
}

#[tokio::test]
async fn lowercased_methods_and_json_bodies_reach_the_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/entries"))
        .and(body_json(json!({"title": "Frieren"})))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let client = FetchClient::new("fetch-test").unwrap();
    let response = client
        .fetch(
            &format!("{}/entries", server.uri()),
            FetchOptions {
                method: Some("post".to_owned()),
                body: Some(FetchBody::Json(json!({"title": "Frieren"}))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(response.ok);
    assert_eq!(response.status, 201);
    assert_eq!(response.method, "POST");
}

#[tokio::test]
async fn form_bodies_travel_as_multipart_with_a_matching_boundary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut form = FormData::new();
    form.append("title", "one piece").unwrap();
    form.append("episode", "1015").unwrap();

    let client = FetchClient::new("fetch-test").unwrap();
    let response = client
        .fetch(
            &format!("{}/upload", server.uri()),
            FetchOptions {
                method: Some("POST".to_owned()),
                body: Some(FetchBody::Form(form)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(response.ok);

    let requests = server.received_requests().await.unwrap();
    let content_type = requests[0]
        .headers
        .get("content-type")
        .expect("a form body advertises its content type")
        .to_str()
        .unwrap();
    assert!(
        content_type.starts_with("multipart/form-data; boundary="),
        "got {content_type:?}"
    );
    let boundary = content_type.rsplit_once("boundary=").unwrap().1;

    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    assert!(body.contains("Content-Disposition: form-data; name=\"title\"\r\n\r\none piece\r\n"));
    assert!(body.contains("Content-Disposition: form-data; name=\"episode\"\r\n\r\n1015\r\n"));
    assert!(body.ends_with(&format!("--{boundary}--\r\n")));
}

#[tokio::test]
async fn redirects_are_followed_and_flagged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("location", format!("{}/new", server.uri()).as_str()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("landed"))
        .mount(&server)
        .await;

    let client = FetchClient::new("fetch-test").unwrap();
    let response = client
        .fetch(&format!("{}/old", server.uri()), FetchOptions::default())
        .await
        .unwrap();

    assert!(response.redirected);
    assert!(response.url.ends_with("/new"), "got {}", response.url);
    assert_eq!(response.text(), "landed");
}

#[tokio::test]
async fn concurrent_requests_respect_the_in_flight_cap() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200).set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let client = FetchClient::with_concurrency("fetch-test", 2).unwrap();
    let url = format!("{}/slow", server.uri());

    // Four 200ms responses through two permits take at least two waves.
    let started = Instant::now();
    let (a, b, c, d) = tokio::join!(
        client.fetch(&url, FetchOptions::default()),
        client.fetch(&url, FetchOptions::default()),
        client.fetch(&url, FetchOptions::default()),
        client.fetch(&url, FetchOptions::default()),
    );
    let elapsed = started.elapsed();

    for response in [a, b, c, d] {
        assert!(response.unwrap().ok);
    }
    assert!(
        elapsed >= Duration::from_millis(390),
        "four requests finished in {elapsed:?}, the cap did not serialize them"
    );
}

#[tokio::test]
async fn slow_responses_hit_the_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hang"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let client = FetchClient::new("fetch-test").unwrap();
    let result = client
        .fetch(
            &format!("{}/hang", server.uri()),
            FetchOptions {
                timeout: Some(1),
                ..Default::default()
            },
        )
        .await;

    match result {
        Err(HostError::Timeout(limit)) => assert_eq!(limit, Duration::from_secs(1)),
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[test]
fn an_aborted_signal_short_circuits_the_request() {
    let scheduler = Scheduler::new("fetch-abort").unwrap();
    let abort = AbortContext::new(scheduler.clone());
    abort.abort(Some("user navigated away".to_owned()));

    let rt = Runtime::new().unwrap();
    let result = rt.block_on(async {
        let client = FetchClient::new("fetch-test").unwrap();
        // Nothing listens on this address; the aborted signal must win
        // before any connection is attempted.
        client
            .fetch(
                "http://127.0.0.1:9/unreachable",
                FetchOptions {
                    signal: Some(abort.signal()),
                    ..Default::default()
                },
            )
            .await
    });

    match result {
        Err(HostError::Cancelled(reason)) => assert_eq!(reason, "user navigated away"),
        other => panic!("expected cancellation, got {other:?}"),
    }
    scheduler.stop();
}
