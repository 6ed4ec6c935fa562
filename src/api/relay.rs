#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{error, info};
use poem::Request;
use poem_openapi::{ OpenApi, payload::Json, Object };
use serde_json::Value;

use crate::api::data::DATA_CONTAINER;
use crate::utils::errors::Errors;
use crate::utils::hello_utils::{self, RequestDebug};

// The upstream path is the data endpoint of another extended instance.
const UPSTREAM_DATA_PATH : &str = "/api/data";
const NETWORKING_TYPE    : &str = "Server-to-Server";
const RELAY_SUCCESS_MSG  : &str = "Poem successfully called the upstream data API";
const RELAY_FAILURE_MSG  : &str = "Failed to call the upstream data API";

// ***************************************************************************
//                          Request/Response Definiions
// ***************************************************************************
/// Calls the data endpoint of a peer instance and wraps its response.
pub struct RelayApi {
    relay_url: String,
    client: reqwest::Client,
}

struct ReqRelay
{
    upstream_url: String,
}

#[derive(Object, Debug)]
pub struct RespRelay
{
    success: bool,
    message: String,
    container: String,
    upstream_url: String,
    networking_type: String,
    #[oai(skip_serializing_if_is_none)]
    upstream_data: Option<Value>,
    #[oai(skip_serializing_if_is_none)]
    error: Option<String>,
    timestamp: String,
}

// Implement the debug record trait for logging.
impl RequestDebug for ReqRelay {
    fn get_request_info(&self) -> String {
        let mut s = String::with_capacity(255);
        s.push_str("  Request body: none");
        s.push_str("\n    upstream_url: ");
        s.push_str(&self.upstream_url);
        s
    }
}

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl RelayApi {
    #[oai(path = "/api/relay", method = "get")]
    async fn get_relay(&self, http_req: &Request) -> Json<RespRelay> {
        let req = ReqRelay {upstream_url: self.upstream_url()};
        hello_utils::debug_request(http_req, &req);

        // Upstream failures are reported in the body, never as an http error.
        match fetch_upstream(&self.client, &req.upstream_url).await {
            Ok(v) => Json(RespRelay::success(req.upstream_url, v)),
            Err(e) => {
                let msg = e.to_string();
                error!("{}", msg);
                Json(RespRelay::failure(req.upstream_url, msg))
            }
        }
    }
}

impl RelayApi {
    /// Build the relay with a single http client shared by all requests.
    /// Peers are addressed directly, never through a proxy.
    pub fn new(relay_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .no_proxy()
            .build()?;
        info!("Relay configured for upstream {}{} with a {} second timeout.",
              relay_url, UPSTREAM_DATA_PATH, timeout_secs);
        Ok(Self {relay_url: relay_url.trim_end_matches('/').to_string(), client})
    }

    fn upstream_url(&self) -> String {
        self.relay_url.clone() + UPSTREAM_DATA_PATH
    }
}

// ***************************************************************************
//                          Request/Response Methods
// ***************************************************************************
impl RespRelay {
    fn success(upstream_url: String, upstream_data: Value) -> Self {
        Self {
            success: true,
            message: RELAY_SUCCESS_MSG.to_string(),
            container: DATA_CONTAINER.to_string(),
            upstream_url,
            networking_type: NETWORKING_TYPE.to_string(),
            upstream_data: Some(upstream_data),
            error: None,
            timestamp: hello_utils::timestamp_str(),
        }
    }

    fn failure(upstream_url: String, error: String) -> Self {
        Self {
            success: false,
            message: RELAY_FAILURE_MSG.to_string(),
            container: DATA_CONTAINER.to_string(),
            upstream_url,
            networking_type: NETWORKING_TYPE.to_string(),
            upstream_data: None,
            error: Some(error),
            timestamp: hello_utils::timestamp_str(),
        }
    }
}

// ***************************************************************************
//                          Private Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// fetch_upstream:
// ---------------------------------------------------------------------------
/** Get the upstream data document.  Connection failures, timeouts, non-2xx
 * statuses and non-json bodies are all errors.
 */
async fn fetch_upstream(client: &reqwest::Client, url: &str) -> Result<Value> {
    let relay_err = |e: reqwest::Error| anyhow!(Errors::RelayError(url.to_string(), e.to_string()));

    let resp = client.get(url).send().await.map_err(relay_err)?;
    let resp = resp.error_for_status().map_err(relay_err)?;
    let data = resp.json::<Value>().await.map_err(relay_err)?;
    Ok(data)
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::data::DataApi;
    use poem::http::StatusCode;
    use poem::listener::TcpAcceptor;
    use poem::{get, handler, test::TestClient, Route, Server};
    use poem_openapi::OpenApiService;

    fn relay_client(relay_url: &str, timeout_secs: u64) -> TestClient<Route> {
        let relay = RelayApi::new(relay_url, timeout_secs).unwrap();
        let api_service = OpenApiService::new(relay, "Hello Test", "0.1.0");
        TestClient::new(Route::new().nest("/", api_service))
    }

    async fn body_of(cli: &TestClient<Route>) -> Value {
        let resp = cli.get("/api/relay").send().await;
        resp.assert_status_is_ok();
        serde_json::from_str(&resp.0.into_body().into_string().await.unwrap()).unwrap()
    }

    // Serve an upstream on an ephemeral port and return its base url.
    fn spawn_upstream(upstream: Route) -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = TcpAcceptor::from_std(listener).unwrap();
        tokio::spawn(Server::new_with_acceptor(acceptor).run(upstream));
        format!("http://127.0.0.1:{}", port)
    }

    fn assert_failure(body: &Value, upstream_url: &str) {
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], RELAY_FAILURE_MSG);
        assert_eq!(body["upstream_url"], upstream_url);
        let prefix = format!("Upstream request to {} failed", upstream_url);
        assert!(body["error"].as_str().unwrap().starts_with(&prefix));
        assert!(body.get("upstream_data").is_none());
    }

    #[handler]
    fn failing_data() -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    #[handler]
    fn plain_text_data() -> &'static str {
        "not json"
    }

    #[test]
    fn upstream_url_ignores_trailing_slash() {
        let relay = RelayApi::new("http://peer:5001/", 1).unwrap();
        assert_eq!(relay.upstream_url(), "http://peer:5001/api/data");
    }

    #[tokio::test]
    async fn unreachable_upstream_reports_failure() {
        let body = body_of(&relay_client("http://127.0.0.1:1", 2)).await;
        assert_failure(&body, "http://127.0.0.1:1/api/data");
    }

    #[tokio::test]
    async fn upstream_server_error_reports_failure() {
        let base = spawn_upstream(Route::new().at("/api/data", get(failing_data)));
        let body = body_of(&relay_client(&base, 2)).await;
        assert_failure(&body, &format!("{}/api/data", base));
        assert!(body["error"].as_str().unwrap().contains("500"));
    }

    #[tokio::test]
    async fn non_json_upstream_reports_failure() {
        let base = spawn_upstream(Route::new().at("/api/data", get(plain_text_data)));
        let body = body_of(&relay_client(&base, 2)).await;
        assert_failure(&body, &format!("{}/api/data", base));
    }

    #[tokio::test]
    async fn stalled_upstream_times_out() {
        // The listener queues the connection but never answers it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
        let body = body_of(&relay_client(&base, 1)).await;
        assert_failure(&body, &format!("{}/api/data", base));
        drop(listener);
    }

    #[tokio::test]
    async fn reachable_upstream_is_embedded() {
        let upstream = Route::new().nest("/", OpenApiService::new(DataApi, "Upstream", "0.1.0"));
        let base = spawn_upstream(upstream);

        let body = body_of(&relay_client(&base, 2)).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["networking_type"], NETWORKING_TYPE);
        assert_eq!(body["upstream_data"]["success"], true);
        assert_eq!(body["upstream_data"]["data"]["items"].as_array().unwrap().len(), 3);
        assert!(body.get("error").is_none());
    }
}
