use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hichat_store::StoreError;
use serde::{Deserialize, Serialize};

/// Response envelope expected by the HiChat web client:
/// `{ SC, Code, Msg, Data, Rows, Total }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseBody {
    #[serde(rename = "SC")]
    pub status: u16,
    #[serde(rename = "Code")]
    pub code: i32,
    #[serde(rename = "Msg")]
    pub msg: String,
    #[serde(rename = "Data")]
    pub data: Option<HashMap<String, String>>,
    #[serde(rename = "Rows")]
    pub rows: serde_json::Value,
    #[serde(rename = "Total")]
    pub total: usize,
}

pub const CODE_OK: i32 = 0;
pub const CODE_ERROR: i32 = -1;

impl ResponseBody {
    pub fn ok(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            code: CODE_OK,
            msg: msg.into(),
            data: None,
            rows: serde_json::Value::Null,
            total: 0,
        }
    }

    pub fn with_rows(mut self, rows: Vec<String>) -> Self {
        self.total = rows.len();
        self.rows = serde_json::Value::from(rows);
        self
    }

    pub fn with_data(mut self, key: &str, value: impl ToString) -> Self {
        self.data
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn error(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            code: CODE_ERROR,
            msg: msg.into(),
            data: None,
            rows: serde_json::Value::Null,
            total: 0,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::error(StatusCode::BAD_REQUEST, msg)
    }

    /// Map a store failure onto the closest HTTP status.
    pub fn from_store_error(err: &StoreError) -> Self {
        let status = match err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::Database(_) | StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::error(status, err.to_string())
    }
}

impl IntoResponse for ResponseBody {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Integer form/query value; absent or unparseable values read as 0.
pub fn lenient_i64(params: &HashMap<String, String>, key: &str) -> i64 {
    params
        .get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Boolean form value in the spellings web clients send (`true`, `1`, `T`, ...).
/// Anything else reads as false.
pub fn lenient_bool(params: &HashMap<String, String>, key: &str) -> bool {
    matches!(
        params.get(key).map(|v| v.trim()),
        Some("1" | "t" | "T" | "true" | "TRUE" | "True")
    )
}

/// Required, non-empty string value.
pub fn require_str<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("Missing required parameter: {key}"))
}

/// Required value that must parse as `T`.
pub fn require_parsed<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    key: &str,
) -> Result<T, String> {
    require_str(params, key)?
        .parse()
        .map_err(|_| format!("Invalid parameter: {key}"))
}
