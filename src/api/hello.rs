#![forbid(unsafe_code)]

use poem::Request;
use poem_openapi::{ OpenApi, payload::Json, Object };

use crate::utils::hello_utils::{self, RequestDebug};

// Greeting constants shared by both variants.
pub const HELLO_MESSAGE   : &str = "Hello from Poem";
pub const HELLO_FRAMEWORK : &str = "Rust Poem";

// ***************************************************************************
//                          Request/Response Definiions
// ***************************************************************************
pub struct HelloApi;

struct ReqHello;

#[derive(Object, Debug)]
pub struct RespHello
{
    message: String,
    framework: String,
    timestamp: String,
}

// Implement the debug record trait for logging.
impl RequestDebug for ReqHello {
    fn get_request_info(&self) -> String {
        "  Request body: none".to_string()
    }
}

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl HelloApi {
    #[oai(path = "/", method = "get")]
    async fn get_hello(&self, http_req: &Request) -> Json<RespHello> {
        hello_utils::debug_request(http_req, &ReqHello);
        Json(RespHello::process())
    }
}

// ***************************************************************************
//                          Request/Response Methods
// ***************************************************************************
impl RespHello {
    fn new(message: &str, framework: &str, timestamp: String) -> Self {
        Self {message: message.to_string(), framework: framework.to_string(), timestamp}
    }

    /// The timestamp is taken on every call, never cached.
    fn process() -> RespHello {
        Self::new(HELLO_MESSAGE, HELLO_FRAMEWORK, hello_utils::timestamp_str())
    }
}
