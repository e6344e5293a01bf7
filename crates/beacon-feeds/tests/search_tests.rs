//! Search controller tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::{EngineError, FallbackEntry, Result, SearchConfig};
use beacon_feeds::{
    HttpSearchClient, SearchClient, SearchController, SearchRequest, SearchResponse, SearchResult,
};
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Records every request; answers after a per-query delay.
#[derive(Default)]
struct RecordingClient {
    requests: Mutex<Vec<SearchRequest>>,
    delays: HashMap<String, Duration>,
    fail: bool,
}

impl RecordingClient {
    fn with_delay(mut self, query: &str, delay: Duration) -> Self {
        self.delays.insert(query.to_string(), delay);
        self
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn queries(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.query.clone())
            .collect()
    }
}

#[async_trait]
impl SearchClient for RecordingClient {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delays.get(&request.query) {
            tokio::time::sleep(*delay).await;
        }
        if self.fail {
            return Err(EngineError::transport("connection refused"));
        }
        Ok(SearchResponse {
            results: vec![SearchResult {
                title: format!("result for {}", request.query),
                description: String::new(),
                metadata: json!({}),
            }],
            error: None,
        })
    }
}

fn controller(client: Arc<RecordingClient>, config: &SearchConfig) -> SearchController {
    SearchController::new(client, config).0
}

mod debounce {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_request() {
        let client = Arc::new(RecordingClient::default());
        let ctl = controller(Arc::clone(&client), &SearchConfig::default().with_debounce_ms(300));

        ctl.on_query_change("a").await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        ctl.on_query_change("ab").await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let token = ctl.on_query_change("abc").await;

        tokio::time::sleep(Duration::from_millis(299)).await;
        assert!(client.queries().is_empty(), "fired before the quiet period");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.queries(), vec!["abc".to_string()]);

        let state = ctl.state();
        assert_eq!(state.request_token, token);
        assert_eq!(state.text, "abc");
        assert_eq!(state.results[0].title, "result for abc");
        assert!(!state.loading);
        assert!(!state.used_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_increase_monotonically() {
        let client = Arc::new(RecordingClient::default());
        let ctl = controller(client, &SearchConfig::default());

        let t1 = ctl.on_query_change("x").await;
        let t2 = ctl.on_query_change("").await;
        let t3 = ctl.on_query_change("y").await;
        assert!(t1 < t2 && t2 < t3);
        assert_eq!(ctl.latest_token(), t3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_text_clears_without_request() {
        let client = Arc::new(RecordingClient::default());
        let ctl = controller(Arc::clone(&client), &SearchConfig::default());

        ctl.on_query_change("revenue").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctl.state().results.len(), 1);

        ctl.on_query_change("").await;
        let state = ctl.state();
        assert!(state.results.is_empty());
        assert!(!state.loading);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.queries(), vec!["revenue".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clearing_cancels_scheduled_search() {
        let client = Arc::new(RecordingClient::default());
        let ctl = controller(Arc::clone(&client), &SearchConfig::default());

        ctl.on_query_change("rev").await;
        ctl.on_query_change("").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(client.queries().is_empty());
        assert!(ctl.state().results.is_empty());
    }
}

mod stale_responses {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_later_query_wins_when_it_resolves_first() {
        let client = Arc::new(
            RecordingClient::default()
                .with_delay("q1", Duration::from_secs(2))
                .with_delay("q2", Duration::from_millis(100)),
        );
        let ctl = controller(Arc::clone(&client), &SearchConfig::default());

        ctl.on_query_change("q1").await;
        // Let q1 go out and sit in flight.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(client.queries(), vec!["q1".to_string()]);
        assert!(ctl.state().loading);

        let token = ctl.on_query_change("q2").await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(client.queries(), vec!["q1".to_string(), "q2".to_string()]);
        let state = ctl.state();
        assert_eq!(state.request_token, token);
        assert_eq!(state.text, "q2");
        assert_eq!(state.results.len(), 1);
        assert_eq!(state.results[0].title, "result for q2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_stream_only_carries_current_tokens() {
        let client = Arc::new(RecordingClient::default().with_delay("q1", Duration::from_secs(2)));
        let (ctl, mut updates) = SearchController::new(
            Arc::clone(&client) as Arc<dyn SearchClient>,
            &SearchConfig::default(),
        );

        let t1 = ctl.on_query_change("q1").await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        let t2 = ctl.on_query_change("q2").await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let mut seen = Vec::new();
        while let Ok(state) = updates.try_recv() {
            seen.push(state);
        }
        assert!(seen.iter().any(|s| s.request_token == t1 && s.loading));
        assert!(
            !seen
                .iter()
                .any(|s| s.request_token == t1 && !s.results.is_empty()),
            "stale results were published"
        );
        let last = seen.last().unwrap();
        assert_eq!(last.request_token, t2);
        assert_eq!(last.results[0].title, "result for q2");
    }
}

mod fallback {
    use super::*;

    fn catalog() -> SearchConfig {
        SearchConfig::default()
            .with_fallback(FallbackEntry::new("Revenue overview", "Monthly recurring revenue"))
            .with_fallback(FallbackEntry::new("Open projects", "Projects by owner"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_uses_matching_catalog_entries() {
        let client = Arc::new(RecordingClient::failing());
        let ctl = controller(client, &catalog());

        ctl.on_query_change("revenue").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let state = ctl.state();
        assert!(state.used_fallback);
        assert!(!state.loading);
        assert!(state.error.is_some());
        assert_eq!(state.results.len(), 1);
        assert_eq!(state.results[0].title, "Revenue overview");
        assert_eq!(state.results[0].metadata["fallback"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_uses_placeholder() {
        let client =
            Arc::new(RecordingClient::default().with_delay("churn", Duration::from_secs(30)));
        let ctl = controller(client, &catalog().with_timeout_ms(1_000));

        ctl.on_query_change("churn").await;
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert!(ctl.state().loading);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = ctl.state();
        assert!(!state.loading, "search left spinning after timeout");
        assert!(state.used_fallback);
        assert_eq!(state.results.len(), 1);
        assert!(state.results[0].title.contains("churn"));
        assert_eq!(state.results[0].metadata["fallback"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_fallback_flag() {
        let client = Arc::new(RecordingClient::default().with_delay("slow", Duration::from_secs(30)));
        let ctl = controller(client, &catalog().with_timeout_ms(1_000));

        ctl.on_query_change("slow").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(ctl.state().used_fallback);

        ctl.on_query_change("fast").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let state = ctl.state();
        assert!(!state.used_fallback);
        assert!(state.error.is_none());
        assert_eq!(state.results[0].title, "result for fast");
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent_and_final() {
        let client = Arc::new(RecordingClient::default());
        let ctl = controller(Arc::clone(&client), &SearchConfig::default());

        ctl.on_query_change("pending").await;
        ctl.shutdown().await;
        ctl.shutdown().await;

        ctl.on_query_change("after").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(client.queries().is_empty());
        assert!(!ctl.state().loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_are_forwarded() {
        let client = Arc::new(RecordingClient::default());
        let ctl = controller(Arc::clone(&client), &SearchConfig::default());

        ctl.set_filters(Some(json!({"team": "sales"}))).await;
        ctl.on_query_change("deals").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests[0].filters, Some(json!({"team": "sales"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_receiver_sees_latest_state() {
        let client = Arc::new(RecordingClient::default());
        let ctl = controller(client, &SearchConfig::default());
        let mut rx = ctl.subscribe();

        ctl.on_query_change("pipeline").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(rx.has_changed().unwrap());
        let state = rx.borrow_and_update().clone();
        assert_eq!(state.results[0].title, "result for pipeline");
    }
}

mod http_client {
    use super::*;

    #[tokio::test]
    async fn test_single_request_for_final_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_json(json!({"query": "abc"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"title": "ABC Corp", "description": "Customer", "metadata": {"id": 7}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = SearchConfig::default()
            .with_endpoint(format!("{}/search", server.uri()))
            .with_debounce_ms(300);
        let client = Arc::new(HttpSearchClient::from_config(&config).unwrap());
        let (ctl, _updates) = SearchController::new(client, &config);

        for text in ["a", "ab", "abc"] {
            ctl.on_query_change(text).await;
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        tokio::time::sleep(Duration::from_millis(800)).await;

        let state = ctl.state();
        assert_eq!(state.results.len(), 1);
        assert_eq!(state.results[0].title, "ABC Corp");
        assert_eq!(state.results[0].metadata["id"], 7);
        assert!(!state.used_fallback);
        // `expect(1)` is verified when the server drops.
    }

    #[tokio::test]
    async fn test_server_error_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let config = SearchConfig::default()
            .with_endpoint(server.uri())
            .with_debounce_ms(10);
        let client = Arc::new(HttpSearchClient::from_config(&config).unwrap());
        let (ctl, _updates) = SearchController::new(client, &config);

        ctl.on_query_change("margin").await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let state = ctl.state();
        assert!(state.used_fallback);
        assert_eq!(state.results[0].metadata["fallback"], true);
    }

    #[tokio::test]
    async fn test_reported_error_is_application() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"results": [], "error": "bad query"})),
            )
            .mount(&server)
            .await;

        let client = HttpSearchClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = client
            .search(&SearchRequest {
                query: "x".into(),
                filters: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), beacon_core::ErrorKind::Application);
        assert!(err.to_string().contains("bad query"));
    }
}
