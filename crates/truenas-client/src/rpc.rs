//! JSON-RPC 2.0 framing for the middleware websocket

use crate::error::TrueNasError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub(crate) struct RpcRequest<'a> {
    jsonrpc: &'static str,
    pub id: String,
    method: &'a str,
    params: Value,
}

impl<'a> RpcRequest<'a> {
    pub fn new(method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: uuid::Uuid::new_v4().to_string(),
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<RpcErrorData>,
}

/// Middleware-specific error detail
#[derive(Debug, Deserialize)]
pub(crate) struct RpcErrorData {
    #[serde(default)]
    pub errname: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// A response or a server-initiated notification (no `id`)
#[derive(Debug, Deserialize)]
pub(crate) struct RpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    pub fn answers(&self, request_id: &str) -> bool {
        self.id.as_ref().and_then(Value::as_str) == Some(request_id)
    }

    pub fn into_result(self, method: &str) -> Result<Value, TrueNasError> {
        match self.error {
            Some(error) => {
                let (errname, reason) = error
                    .data
                    .map(|data| (data.errname, data.reason))
                    .unwrap_or_default();
                Err(TrueNasError::Rpc {
                    method: method.to_string(),
                    code: error.code,
                    message: reason.unwrap_or(error.message),
                    errname,
                })
            }
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
