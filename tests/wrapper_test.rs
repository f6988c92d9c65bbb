//! End-to-end wrapper scenarios against a mocked LRS.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use xapi_wrapper::{
    Backoff, HttpTransport, Statement, StatementQuery, WrapperOptions, XapiError, XapiWrapper,
};

fn fast_backoff() -> Backoff {
    Backoff {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(200),
        jitter_factor: 0.1,
    }
}

fn wrapper_for(server: &MockServer, max_attempts: u32) -> XapiWrapper {
    XapiWrapper::with_transport(
        WrapperOptions::new()
            .endpoint(format!("{}/xapi", server.uri()))
            .basic_auth("key", "secret")
            .max_attempts(max_attempts)
            .timeout_ms(2_000),
        Arc::new(HttpTransport::new().unwrap()),
        fast_backoff(),
    )
    .unwrap()
}

fn statement(activity: &str) -> Statement {
    Statement::new(
        json!({"mbox": "mailto:a@example.com"}),
        json!({"id": "http://verb/completed"}),
        json!({"id": activity}),
    )
}

fn body_of(request: &Request) -> Value {
    serde_json::from_slice(&request.body).unwrap_or(Value::Null)
}

#[tokio::test]
async fn test_send_statement_resolves_with_lrs_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/xapi/statements"))
        .and(header("X-Experience-API-Version", "1.0.3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["stored-id"])))
        .expect(1)
        .mount(&server)
        .await;

    let wrapper = wrapper_for(&server, 3);
    let delivery = wrapper
        .send_statement(statement("http://activity/1"))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(delivery.response.body, json!(["stored-id"]));
    assert_eq!(delivery.attempts, 1);
    assert_eq!(wrapper.queue_len(), 0);
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let server = MockServer::start().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    Mock::given(method("POST"))
        .respond_with(move |_req: &Request| -> ResponseTemplate {
            let current = attempts_clone.fetch_add(1, Ordering::SeqCst);
            if current < 2 {
                ResponseTemplate::new(503)
            } else {
                ResponseTemplate::new(200).set_body_json(json!(["ok"]))
            }
        })
        .expect(3)
        .mount(&server)
        .await;

    let wrapper = wrapper_for(&server, 3);
    let handle = wrapper.send_statement(statement("http://activity/1")).unwrap();
    let statement_id = handle.statement_ids()[0];
    let delivery = handle.await.unwrap();

    assert_eq!(delivery.attempts, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // Every retry carries the same statement id
    let received = server.received_requests().await.unwrap();
    for request in &received {
        assert_eq!(body_of(request)["id"], json!(statement_id.to_string()));
    }
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let server = MockServer::start().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    Mock::given(method("POST"))
        .respond_with(move |_req: &Request| -> ResponseTemplate {
            if attempts_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(429)
            } else {
                ResponseTemplate::new(200)
            }
        })
        .mount(&server)
        .await;

    let wrapper = wrapper_for(&server, 3);
    let delivery = wrapper.send_statement(statement("http://activity/1")).unwrap().await.unwrap();
    assert_eq!(delivery.attempts, 2);
    assert_eq!(delivery.response.status, 200);
}

#[tokio::test]
async fn test_bad_request_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid statement"))
        .expect(1)
        .mount(&server)
        .await;

    let wrapper = wrapper_for(&server, 3);
    let err = wrapper
        .send_statement(statement("http://activity/1"))
        .unwrap()
        .await
        .unwrap_err();

    match err {
        XapiError::FatalDelivery { attempts, failure } => {
            assert_eq!(attempts, 1);
            assert_eq!(failure.status(), Some(400));
        }
        other => panic!("expected fatal delivery error, got {:?}", other),
    }
    assert_eq!(wrapper.queue_stats().retries, 0);
}

#[tokio::test]
async fn test_exhausted_retries_surface_last_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(2)
        .mount(&server)
        .await;

    let wrapper = wrapper_for(&server, 2);
    let err = wrapper
        .send_statement(statement("http://activity/1"))
        .unwrap()
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.attempts(), 2);
}

#[tokio::test]
async fn test_later_statement_waits_for_failing_one() {
    let server = MockServer::start().await;
    let first_attempts = Arc::new(AtomicUsize::new(0));
    let first_attempts_clone = first_attempts.clone();
    Mock::given(method("POST"))
        .respond_with(move |req: &Request| -> ResponseTemplate {
            let body = body_of(req);
            if body["object"]["id"] == json!("http://activity/a")
                && first_attempts_clone.fetch_add(1, Ordering::SeqCst) < 2
            {
                ResponseTemplate::new(502)
            } else {
                ResponseTemplate::new(200)
            }
        })
        .mount(&server)
        .await;

    let wrapper = wrapper_for(&server, 3);
    let a = wrapper.send_statement(statement("http://activity/a")).unwrap();
    let b = wrapper.send_statement(statement("http://activity/b")).unwrap();
    let (a, b) = tokio::join!(a, b);
    assert!(a.is_ok());
    assert!(b.is_ok());

    let objects: Vec<Value> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| body_of(r)["object"]["id"].clone())
        .collect();
    assert_eq!(
        objects,
        vec![
            json!("http://activity/a"),
            json!("http://activity/a"),
            json!("http://activity/a"),
            json!("http://activity/b"),
        ]
    );
}

#[tokio::test]
async fn test_retries_use_snapshot_from_enqueue_time() {
    let server = MockServer::start().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    Mock::given(method("POST"))
        .and(header("Authorization", "Basic a2V5OnNlY3JldA=="))
        .respond_with(move |_req: &Request| -> ResponseTemplate {
            if attempts_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(503)
            } else {
                ResponseTemplate::new(200)
            }
        })
        .expect(2)
        .mount(&server)
        .await;

    let wrapper = wrapper_for(&server, 3);
    let handle = wrapper.send_statement(statement("http://activity/1")).unwrap();
    wrapper
        .update_config(WrapperOptions::new().bearer_token("rotated"))
        .unwrap();

    assert!(handle.await.is_ok());
}

#[tokio::test]
async fn test_get_statements_and_more() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/xapi/statements"))
        .and(query_param("limit", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "statements": [{"id": "first"}],
            "more": "/xapi/statements?more=page2"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/xapi/statements"))
        .and(query_param("more", "page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "statements": [{"id": "second"}],
            "more": ""
        })))
        .expect(1)
        .mount(&server)
        .await;

    let wrapper = wrapper_for(&server, 3);
    let page = wrapper
        .get_statements(StatementQuery::new().limit(1))
        .unwrap()
        .await
        .unwrap();
    let more = page.response.body["more"].as_str().unwrap().to_string();

    let next = wrapper.get_more_statements(more).unwrap().await.unwrap();
    assert_eq!(next.response.body["statements"][0]["id"], json!("second"));
}

#[tokio::test]
async fn test_state_document_round_trip() {
    let server = MockServer::start().await;
    let agent = json!({"mbox": "mailto:a@example.com"});
    Mock::given(method("PUT"))
        .and(path("/xapi/activities/state"))
        .and(query_param("stateId", "bookmark"))
        .and(query_param("activityId", "http://activity/1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/xapi/activities/state"))
        .and(query_param("stateId", "bookmark"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"page": 4})))
        .expect(1)
        .mount(&server)
        .await;

    let wrapper = wrapper_for(&server, 3);
    let stored = wrapper
        .set_state("http://activity/1", agent.clone(), "bookmark", json!({"page": 4}))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(stored.response.status, 204);
    assert_eq!(stored.response.body, Value::Null);

    let fetched = wrapper
        .get_state("http://activity/1", agent, "bookmark")
        .unwrap()
        .await
        .unwrap();
    assert_eq!(fetched.response.body, json!({"page": 4}));
}

#[tokio::test]
async fn test_invalid_statement_never_reaches_lrs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let wrapper = wrapper_for(&server, 3);
    for missing in ["actor", "verb", "object"] {
        let mut incomplete = statement("http://activity/1");
        match missing {
            "actor" => incomplete.actor = None,
            "verb" => incomplete.verb = None,
            _ => incomplete.object = None,
        }
        let err = wrapper.send_statement(incomplete).unwrap_err();
        assert!(matches!(err, XapiError::Validation(ref e) if e.field.as_deref() == Some(missing)));
    }
    assert_eq!(wrapper.queue_len(), 0);
}
