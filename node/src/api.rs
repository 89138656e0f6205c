//! # JSON-RPC API
//!
//! The axum router in front of the [`Commander`].
//!
//! ## Endpoints
//!
//! | Method | Path      | Description            |
//! |--------|-----------|------------------------|
//! | POST   | `/`       | JSON-RPC 2.0 gateway   |
//! | GET    | `/health` | Liveness probe         |
//!
//! ## Methods
//!
//! Parameters are positional. `rollup_*` methods are public. `admin_*`
//! methods need the configured key in the `Auth-Key` header and are refused
//! outright when the node runs without one.
//!
//! | Method                        | Params                                  |
//! |-------------------------------|-----------------------------------------|
//! | `rollup_sendTransaction`      | `[tx]`                                  |
//! | `rollup_getTransaction`       | `[hash]`                                |
//! | `rollup_getUserState`         | `[stateID]`                             |
//! | `rollup_getPendingState`      | `[stateID]`                             |
//! | `rollup_getBatch`             | `[batchID]`                             |
//! | `rollup_getCommitment`        | `[{batchId, index}]`                    |
//! | `rollup_getCommitmentProof`   | `[{batchId, index}]`                    |
//! | `rollup_getWithdrawProof`     | `[batchID, commitmentIndex, txHash]`    |
//! | `rollup_getStatus`            | `[]`                                    |
//! | `admin_recomputePendingState` | `[stateID, mutate]`                     |
//! | `admin_dropTransaction`       | `[stateID, nonce]`                      |
//! | `admin_revertBatches`         | `[batchID]`                             |
//! | `admin_resetPubkey`           | `[pubKeyID, publicKey or null]`         |
//! | `admin_setMigration`          | `[enabled]`                             |
//! | `admin_registerSpoke`         | `[spokeID]`                             |
//! | `admin_markBatchMined`        | `[batchID, finalisationBlock]`          |
//! | `admin_setLatestBlock`        | `[blockNumber]`                         |
//!
//! Commander errors come back with their stable numeric code and a fixed
//! message; the internal description is attached only for `Unknown` errors
//! in debug mode.

use axum::{
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use primitive_types::{H256, U256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use rollup_protocol::batch::CommitmentId;
use rollup_protocol::crypto::PublicKey;
use rollup_protocol::error::{ApiError, ErrorCode};
use rollup_protocol::transaction::TransactionRequest;
use rollup_protocol::{Commander, CommanderError};

/// Header carrying the admin key.
pub const AUTH_HEADER: &str = "Auth-Key";

const ADMIN_PREFIX: &str = "admin_";

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub commander: Commander,
    pub auth_key: Option<String>,
    pub debug_errors: bool,
}

impl AppState {
    pub fn new(commander: Commander) -> Self {
        let api = &commander.config().api;
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            auth_key: api.auth_key.clone(),
            debug_errors: api.debug_errors,
            commander,
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.auth_key.as_deref() else {
            return false;
        };
        headers
            .get(AUTH_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|given| given == expected)
    }
}

/// Builds the API router with CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", post(rpc_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// JSON-RPC Types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub id: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }
}

impl From<ApiError> for JsonRpcError {
    fn from(err: ApiError) -> Self {
        Self {
            code: i64::from(err.code),
            message: err.message,
            data: err.data.map(serde_json::Value::String),
        }
    }
}

/// Status summary returned by `rollup_getStatus`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub version: String,
    pub mempool_size: usize,
    pub migrating: bool,
    pub batches_created: u64,
    pub reverts: u64,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: 200 while the process is up.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `POST /`: JSON-RPC 2.0 gateway.
async fn rpc_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let outcome = if req.jsonrpc != "2.0" {
        Err(JsonRpcError::invalid_request(
            "Invalid Request: jsonrpc must be \"2.0\"",
        ))
    } else if req.method.starts_with(ADMIN_PREFIX) && !state.authorized(&headers) {
        tracing::warn!(method = %req.method, "unauthorized admin call");
        Err(ApiError::from(ErrorCode::Unauthorized).into())
    } else {
        dispatch(&state, &req.method, Params(req.params.as_ref()))
    };

    let (result, error) = match outcome {
        Ok(value) => (Some(value), None),
        Err(err) => (None, Some(err)),
    };
    Json(JsonRpcResponse {
        jsonrpc: "2.0".into(),
        result,
        error,
        id: req.id,
    })
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Positional parameters of one call.
struct Params<'a>(Option<&'a serde_json::Value>);

impl Params<'_> {
    fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, JsonRpcError> {
        let value = self
            .0
            .and_then(|p| p.as_array())
            .and_then(|arr| arr.get(index))
            .ok_or_else(|| JsonRpcError::invalid_params(format!("missing parameter {}", name)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| JsonRpcError::invalid_params(format!("invalid {}: {}", name, e)))
    }

    /// Like [`Params::get`], but an absent or null parameter is `None`.
    fn optional<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, JsonRpcError> {
        match self.0.and_then(|p| p.as_array()).and_then(|arr| arr.get(index)) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(_) => self.get(index, name).map(Some),
        }
    }
}

fn dispatch(
    state: &AppState,
    method: &str,
    params: Params<'_>,
) -> Result<serde_json::Value, JsonRpcError> {
    let commander = &state.commander;

    match method {
        "rollup_sendTransaction" => {
            let request: TransactionRequest = params.get(0, "transaction")?;
            reply(state, method, commander.send_transaction(request))
        }
        "rollup_getTransaction" => {
            let hash: H256 = params.get(0, "hash")?;
            reply(state, method, commander.get_transaction(&hash))
        }
        "rollup_getUserState" => {
            let state_id: u32 = params.get(0, "stateID")?;
            reply(state, method, commander.get_user_state(state_id))
        }
        "rollup_getPendingState" => {
            let state_id: u32 = params.get(0, "stateID")?;
            reply(state, method, commander.get_pending_state(state_id))
        }
        "rollup_getBatch" => {
            let batch_id: u64 = params.get(0, "batchID")?;
            reply(state, method, commander.get_batch(batch_id))
        }
        "rollup_getCommitment" => {
            let id: CommitmentId = params.get(0, "commitmentID")?;
            reply(state, method, commander.get_commitment(id))
        }
        "rollup_getCommitmentProof" => {
            let id: CommitmentId = params.get(0, "commitmentID")?;
            reply(state, method, commander.get_commitment_proof(id))
        }
        "rollup_getWithdrawProof" => {
            let batch_id: u64 = params.get(0, "batchID")?;
            let index: u32 = params.get(1, "commitmentIndex")?;
            let hash: H256 = params.get(2, "txHash")?;
            reply(state, method, commander.get_withdraw_proof(batch_id, index, &hash))
        }
        "rollup_getStatus" => {
            let stats = commander.stats();
            let status = commander.mempool_size().map(|mempool_size| StatusResponse {
                version: state.version.clone(),
                mempool_size,
                migrating: commander.is_migrating(),
                batches_created: stats.batches_created,
                reverts: stats.reverts,
                timestamp: chrono::Utc::now().to_rfc3339(),
            });
            reply(state, method, status)
        }
        "admin_recomputePendingState" => {
            let state_id: u32 = params.get(0, "stateID")?;
            let mutate: bool = params.optional(1, "mutate")?.unwrap_or(false);
            reply(state, method, commander.recompute_pending_state(state_id, mutate))
        }
        "admin_dropTransaction" => {
            let state_id: u32 = params.get(0, "stateID")?;
            let nonce: U256 = params.get(1, "nonce")?;
            reply(state, method, commander.drop_transaction(state_id, nonce))
        }
        "admin_revertBatches" => {
            let batch_id: u64 = params.get(0, "batchID")?;
            tracing::warn!(batch_id, "revert requested through the API");
            reply(state, method, commander.revert_batches(batch_id))
        }
        "admin_resetPubkey" => {
            let pub_key_id: u32 = params.get(0, "pubKeyID")?;
            let public_key: Option<PublicKey> = params.optional(1, "publicKey")?;
            let reset = commander
                .reset_pubkey(pub_key_id, public_key)
                .map(|(previous, root)| serde_json::json!({ "previous": previous, "accountRoot": root }));
            reply(state, method, reset)
        }
        "admin_setMigration" => {
            let enabled: bool = params.get(0, "enabled")?;
            commander.set_migration(enabled);
            Ok(serde_json::json!(enabled))
        }
        "admin_registerSpoke" => {
            let spoke_id: u32 = params.get(0, "spokeID")?;
            reply(state, method, commander.register_spoke(spoke_id))
        }
        "admin_markBatchMined" => {
            let batch_id: u64 = params.get(0, "batchID")?;
            let block: u64 = params.get(1, "finalisationBlock")?;
            reply(state, method, commander.mark_batch_mined(batch_id, block))
        }
        "admin_setLatestBlock" => {
            let block: u64 = params.get(0, "blockNumber")?;
            reply(state, method, commander.set_latest_block(block))
        }
        _ => Err(JsonRpcError::method_not_found(method)),
    }
}

/// Serialize a commander result, sanitizing errors for the client.
fn reply<T: Serialize>(
    state: &AppState,
    method: &str,
    result: Result<T, CommanderError>,
) -> Result<serde_json::Value, JsonRpcError> {
    match result {
        Ok(value) => serde_json::to_value(value)
            .map_err(|e| JsonRpcError::internal(format!("Internal error: {}", e))),
        Err(err) => {
            if err.code() == ErrorCode::Unknown {
                tracing::error!(method, error = %err, "rpc call failed");
            } else {
                tracing::debug!(method, error = %err, "rpc call rejected");
            }
            Err(ApiError::sanitize(&err, state.debug_errors).into())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
