#![forbid(unsafe_code)]

use anyhow::Result;
use lazy_static::lazy_static;
use log::{debug, info};
use poem::endpoint::BoxEndpoint;
use poem::http::{header, HeaderValue};
use poem::middleware::Cors;
use poem::web::Json;
use poem::{listener::TcpListener, EndpointExt, IntoResponse, Response, Route};
use poem_openapi::{OpenApi, OpenApiService};

// Hello Utilities
use crate::api::data::DataApi;
use crate::api::hello::HelloApi;
use crate::api::relay::RelayApi;
use crate::api::version::{VersionApi, SERVER_VERSION};
use crate::utils::config::{init_log, init_runtime_context, Config, RuntimeCtx, Variant};
use crate::utils::errors::{Errors, HttpResult};

// Modules
mod api;
mod utils;

// ***************************************************************************
//                                Constants
// ***************************************************************************
const SERVER_NAME : &str = "HelloServer"; // for poem logging
const BIND_ADDR   : &str = "0.0.0.0";

// ***************************************************************************
//                             Static Variables
// ***************************************************************************
// Lazily initialize the parameters variable so that is has a 'static lifetime.
// We exit if we can't read our parameters.
lazy_static! {
    static ref RUNTIME_CTX: RuntimeCtx = init_runtime_context();
}

// ---------------------------------------------------------------------------
// main:
// ---------------------------------------------------------------------------
#[tokio::main]
async fn main() -> Result<()> {
    // --------------- Initialize Server -----------------
    // Announce ourselves.
    println!("Starting hello_server!");

    // Initialize the server.
    hello_init();

    // --------------- Main Loop Set Up ---------------
    let variant = RUNTIME_CTX.variant;
    let config = &RUNTIME_CTX.parms.config;
    let app = make_app(variant, config)?;

    // Debug mode is never enabled; the log level comes from log4rs.
    let addr = format!("{}:{}", BIND_ADDR, config.http_port(variant));
    info!("Serving the {} variant on {}.", variant, addr);

    // ------------------ Main Loop -------------------
    poem::Server::new(TcpListener::bind(addr))
        .name(SERVER_NAME)
        .run(app)
        .await?;
    Ok(())
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// hello_init:
// ---------------------------------------------------------------------------
/** Initialize all subsystems other than those needed to configure the main
 * loop processor.
 */
fn hello_init() {
    // Configure our log.
    init_log();

    // Force the reading of input parameters and initialization of runtime context.
    info!("{}", Errors::InputParms(format!("{:#?}", *RUNTIME_CTX)));

    // Log build info.
    print_version_info();
}

// ---------------------------------------------------------------------------
// print_version_info:
// ---------------------------------------------------------------------------
fn print_version_info() {
    info!("\n*** Running HELLO_SERVER={}, BRANCH={}, COMMIT={}, DIRTY={}, SRC_TS={}, RUSTC={}.",
          SERVER_VERSION.unwrap_or("unknown"),
          env!("GIT_BRANCH"),
          env!("GIT_COMMIT_SHORT"),
          env!("GIT_DIRTY"),
          env!("SOURCE_TIMESTAMP"),
          env!("RUSTC_VERSION"),
    );
}

// ---------------------------------------------------------------------------
// make_app:
// ---------------------------------------------------------------------------
/** Assemble the endpoints served by the variant.  Only the extended variant
 * wraps every route, error responses included, in the permissive CORS
 * middleware; responses to requests without an Origin still get `*`.
 */
fn make_app(variant: Variant, config: &Config) -> Result<BoxEndpoint<'static>> {
    // Assign base URL for the openapi document.
    let server_url = format!("{}:{}", config.http_addr, config.http_port(variant));
    let version = SERVER_VERSION.unwrap_or("unknown");

    let app = match variant {
        Variant::Basic => {
            let endpoints = (HelloApi, VersionApi);
            let api_service =
                OpenApiService::new(endpoints, config.title.clone(), version).server(server_url);
            make_routes(api_service)
                .catch_all_error(render_error)
                .boxed()
        }
        Variant::Extended => {
            let relay = RelayApi::new(&config.relay_url, config.relay_timeout_secs)?;
            let endpoints = (HelloApi, DataApi, relay, VersionApi);
            let api_service =
                OpenApiService::new(endpoints, config.title.clone(), version).server(server_url);
            make_routes(api_service)
                .catch_all_error(render_error)
                .with(Cors::new())
                .after(allow_any_origin)
                .boxed()
        }
    };

    Ok(app)
}

// ---------------------------------------------------------------------------
// make_routes:
// ---------------------------------------------------------------------------
fn make_routes<T: OpenApi + 'static>(api_service: OpenApiService<T, ()>) -> Route {
    // Allow the generated openapi specs to be retrieved from the server.
    let spec = api_service.spec_endpoint();
    let spec_yaml = api_service.spec_endpoint_yaml();
    let ui = api_service.swagger_ui();

    Route::new()
        .nest("/swagger", ui)
        .at("/spec", spec)
        .at("/spec_yaml", spec_yaml)
        .nest("/", api_service)
}

// ---------------------------------------------------------------------------
// render_error:
// ---------------------------------------------------------------------------
/** Framework errors keep their status code and get a json body. */
async fn render_error(err: poem::Error) -> Response {
    let status = err.status();
    let msg = err.to_string();
    debug!("Request failed with status {}: {}", status, msg);
    Json(HttpResult::new(status.as_u16().to_string(), msg))
        .with_status(status)
        .into_response()
}

// ---------------------------------------------------------------------------
// allow_any_origin:
// ---------------------------------------------------------------------------
/** Cors only answers requests that carry an Origin header.  Every other
 * response gets the wildcard so that all extended responses are shareable.
 */
async fn allow_any_origin(resp: poem::Result<Response>) -> poem::Result<Response> {
    let mut resp = resp?;
    if !resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN) {
        resp.headers_mut().insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    }
    Ok(resp)
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use poem::http::StatusCode;
    use poem::test::{TestClient, TestResponse};
    use serde_json::Value;

    const ORIGIN : &str = "http://browser-client.example:3000";

    fn client(variant: Variant) -> TestClient<BoxEndpoint<'static>> {
        TestClient::new(make_app(variant, &Config::new()).unwrap())
    }

    async fn json_body(resp: TestResponse) -> Value {
        serde_json::from_str(&resp.0.into_body().into_string().await.unwrap()).unwrap()
    }

    fn allow_origin(resp: &TestResponse) -> Option<String> {
        resp.0.headers()
            .get("access-control-allow-origin")
            .map(|v| v.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn root_has_same_shape_in_both_variants() {
        for variant in [Variant::Basic, Variant::Extended] {
            let resp = client(variant).get("/").send().await;
            resp.assert_status_is_ok();
            let body = json_body(resp).await;
            for key in ["message", "framework", "timestamp"] {
                assert!(body[key].is_string(), "{} missing for {}", key, variant);
            }
        }
    }

    #[tokio::test]
    async fn sequential_timestamps_do_not_go_backwards() {
        let cli = client(Variant::Basic);
        let first = json_body(cli.get("/").send().await).await;
        let second = json_body(cli.get("/").send().await).await;
        let parse = |v: &Value| chrono::NaiveDateTime::parse_from_str(
            v["timestamp"].as_str().unwrap(), "%Y-%m-%dT%H:%M:%S%.f").unwrap();
        assert!(parse(&first) <= parse(&second));
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        for variant in [Variant::Basic, Variant::Extended] {
            let resp = client(variant).get("/nonexistent").send().await;
            resp.assert_status(StatusCode::NOT_FOUND);
            let body = json_body(resp).await;
            assert_eq!(body["result_code"], "404");
        }
    }

    #[tokio::test]
    async fn basic_variant_has_no_data_and_no_cors() {
        let cli = client(Variant::Basic);
        cli.get("/api/data").send().await.assert_status(StatusCode::NOT_FOUND);
        cli.get("/api/relay").send().await.assert_status(StatusCode::NOT_FOUND);

        let resp = cli.get("/").header("Origin", ORIGIN).send().await;
        resp.assert_status_is_ok();
        assert_eq!(allow_origin(&resp), None);
    }

    #[tokio::test]
    async fn extended_variant_serves_data() {
        let resp = client(Variant::Extended).get("/api/data").send().await;
        resp.assert_status_is_ok();
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        let items = body["data"]["items"].as_array().unwrap();
        let names: Vec<&str> = items.iter().map(|i| i["name"].as_str().unwrap()).collect();
        assert_eq!(names, ["Docker", "Flask", "React"]);
    }

    #[tokio::test]
    async fn extended_variant_allows_any_origin() {
        let cli = client(Variant::Extended);
        for path in ["/", "/api/data", "/version", "/nonexistent"] {
            let resp = cli.get(path).header("Origin", ORIGIN).send().await;
            let allowed = allow_origin(&resp).unwrap_or_default();
            assert!(allowed == ORIGIN || allowed == "*", "{} allowed {:?}", path, allowed);
        }
    }

    #[tokio::test]
    async fn extended_variant_allows_any_origin_without_origin_header() {
        let cli = client(Variant::Extended);
        for path in ["/", "/api/data", "/nonexistent"] {
            let resp = cli.get(path).send().await;
            assert_eq!(allow_origin(&resp).as_deref(), Some("*"), "{}", path);
        }
        cli.get("/nonexistent").send().await.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn extended_variant_answers_preflight() {
        let resp = client(Variant::Extended)
            .options("/api/data")
            .header("Origin", ORIGIN)
            .header("Access-Control-Request-Method", "GET")
            .send()
            .await;
        resp.assert_status_is_ok();
        let allowed = allow_origin(&resp).unwrap_or_default();
        assert!(allowed == ORIGIN || allowed == "*");
    }

    #[tokio::test]
    async fn concurrent_requests_do_not_interfere() {
        let cli = client(Variant::Extended);
        let (a, b) = futures::future::join(
            cli.get("/api/data").send(),
            cli.get("/api/data").send(),
        ).await;
        let mut a = json_body(a).await;
        let mut b = json_body(b).await;
        a.as_object_mut().unwrap().remove("timestamp");
        b.as_object_mut().unwrap().remove("timestamp");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn openapi_document_lists_variant_paths() {
        let basic = json_body(client(Variant::Basic).get("/spec").send().await).await;
        assert!(basic["paths"].get("/").is_some());
        assert!(basic["paths"].get("/api/data").is_none());

        let extended = json_body(client(Variant::Extended).get("/spec").send().await).await;
        assert!(extended["paths"].get("/api/data").is_some());
        assert!(extended["paths"].get("/api/relay").is_some());
        assert_eq!(extended["servers"][0]["url"], "http://localhost:5001");
    }

    #[tokio::test]
    async fn openapi_yaml_and_swagger_are_served() {
        for variant in [Variant::Basic, Variant::Extended] {
            let cli = client(variant);
            cli.get("/spec_yaml").send().await.assert_status_is_ok();
            cli.get("/swagger").send().await.assert_status_is_ok();
        }
    }
}
