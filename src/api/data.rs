#![forbid(unsafe_code)]

use poem::Request;
use poem_openapi::{ OpenApi, payload::Json, Object };

use crate::api::hello::HELLO_FRAMEWORK;
use crate::utils::hello_utils::{self, RequestDebug};

pub const DATA_MESSAGE   : &str = "Data from Poem API";
pub const DATA_CONTAINER : &str = "rust-poem-demo";

// The fixed item catalog served by /api/data, in response order.
const DATA_ITEMS : [(i32, &str, &str); 3] = [
    (1, "Docker", "Container Platform"),
    (2, "Flask",  "Python Framework"),
    (3, "React",  "JavaScript Library"),
];

// ***************************************************************************
//                          Request/Response Definiions
// ***************************************************************************
pub struct DataApi;

struct ReqData;

#[derive(Object, Debug)]
pub struct RespData
{
    success: bool,
    message: String,
    framework: String,
    container: String,
    timestamp: String,
    data: DataItems,
}

#[derive(Object, Debug)]
pub struct DataItems
{
    items: Vec<DataItem>,
}

#[derive(Object, Debug, PartialEq)]
pub struct DataItem
{
    id: i32,
    name: String,
    #[oai(rename = "type")]
    item_type: String,
}

// Implement the debug record trait for logging.
impl RequestDebug for ReqData {
    fn get_request_info(&self) -> String {
        "  Request body: none".to_string()
    }
}

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl DataApi {
    #[oai(path = "/api/data", method = "get")]
    async fn get_data(&self, http_req: &Request) -> Json<RespData> {
        hello_utils::debug_request(http_req, &ReqData);
        Json(RespData::process())
    }
}

// ***************************************************************************
//                          Request/Response Methods
// ***************************************************************************
impl DataItem {
    fn new(id: i32, name: &str, item_type: &str) -> Self {
        Self {id, name: name.to_string(), item_type: item_type.to_string()}
    }
}

impl RespData {
    fn process() -> RespData {
        let items = DATA_ITEMS.iter()
            .map(|(id, name, item_type)| DataItem::new(*id, name, item_type))
            .collect();
        Self {
            success: true,
            message: DATA_MESSAGE.to_string(),
            framework: HELLO_FRAMEWORK.to_string(),
            container: DATA_CONTAINER.to_string(),
            timestamp: hello_utils::timestamp_str(),
            data: DataItems {items},
        }
    }
}
