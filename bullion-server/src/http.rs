//! REST routing for the admin surface and the messaging webhook.

use std::sync::Arc;

use chrono::Utc;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use bullion_engine::{CloseUpdate, EngineError, OpenTradeRequest, TransactionRequest};

use crate::webhook::{self, WebhookAccept, WebhookForm};
use crate::AppContext;

const EMPTY_TWIML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>";

#[derive(Debug, Deserialize)]
struct CreateOrderBody {
    #[serde(rename = "userId")]
    user_id: Uuid,
    #[serde(flatten)]
    request: OpenTradeRequest,
}

#[derive(Debug, Deserialize)]
struct TransactionBody {
    #[serde(rename = "adminId")]
    admin_id: Uuid,
    #[serde(flatten)]
    request: TransactionRequest,
}

/// Route one request. Never panics; every branch answers.
pub async fn route(req: Request<Body>, ctx: Arc<AppContext>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => json_response(
            StatusCode::OK,
            json!({
                "success": true,
                "data": {
                    "status": "running",
                    "timestamp": Utc::now().to_rfc3339(),
                }
            }),
        ),
        (&Method::POST, ["api", "chat", "whatsapp"]) => handle_webhook(req, &ctx).await,
        (&Method::POST, ["api", "admin", "create-order", admin_id]) => {
            let admin_id = admin_id.to_string();
            if let Err(resp) = check_api_key(&req, &ctx) {
                return resp;
            }
            handle_create_order(req, &ctx, &admin_id).await
        }
        (&Method::GET, ["api", "admin", "order", admin_id]) => {
            if let Err(resp) = check_api_key(&req, &ctx) {
                return resp;
            }
            handle_list_orders(&ctx, admin_id)
        }
        (&Method::PATCH, ["api", "admin", "order", admin_id, order_id]) => {
            let admin_id = admin_id.to_string();
            let order_id = order_id.to_string();
            if let Err(resp) = check_api_key(&req, &ctx) {
                return resp;
            }
            handle_patch_order(req, &ctx, &admin_id, &order_id).await
        }
        (&Method::POST, ["api", "admin", "transaction"]) => {
            if let Err(resp) = check_api_key(&req, &ctx) {
                return resp;
            }
            handle_transaction(req, &ctx).await
        }
        _ => json_response(
            StatusCode::NOT_FOUND,
            json!({"success": false, "error": "not found"}),
        ),
    }
}

fn check_api_key(req: &Request<Body>, ctx: &Arc<AppContext>) -> Result<(), Response<Body>> {
    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if ctx.api_key.is_empty() || provided == ctx.api_key {
        Ok(())
    } else {
        Err(json_response(
            StatusCode::UNAUTHORIZED,
            json!({"success": false, "error": "invalid API key"}),
        ))
    }
}

async fn handle_webhook(req: Request<Body>, ctx: &Arc<AppContext>) -> Response<Body> {
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to read webhook body");
            return twiml_response();
        }
    };
    let form: WebhookForm = match serde_urlencoded::from_bytes(&bytes) {
        Ok(form) => form,
        Err(_) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({"success": false, "error": "malformed form body"}),
            )
        }
    };
    match webhook::accept(ctx, form) {
        WebhookAccept::Accepted | WebhookAccept::Duplicate => twiml_response(),
        WebhookAccept::Invalid(reason) => json_response(
            StatusCode::BAD_REQUEST,
            json!({"success": false, "error": reason}),
        ),
    }
}

async fn handle_create_order(
    req: Request<Body>,
    ctx: &Arc<AppContext>,
    admin_id: &str,
) -> Response<Body> {
    let Ok(admin_id) = admin_id.parse::<Uuid>() else {
        return bad_request("invalid admin id");
    };
    let body: CreateOrderBody = match read_json(req).await {
        Ok(body) => body,
        Err(resp) => return *resp,
    };

    match ctx
        .engine
        .open_trade(admin_id, body.user_id, body.request)
        .await
    {
        Ok(outcome) => {
            ctx.metrics.inc_order();
            json_response(
                StatusCode::CREATED,
                json!({"success": true, "data": outcome}),
            )
        }
        Err(err) => {
            ctx.metrics.inc_order_failure();
            engine_error_response(err)
        }
    }
}

fn handle_list_orders(ctx: &Arc<AppContext>, admin_id: &str) -> Response<Body> {
    let Ok(admin_id) = admin_id.parse::<Uuid>() else {
        return bad_request("invalid admin id");
    };
    match ctx.engine.orders_for_admin(admin_id) {
        Ok(orders) => json_response(StatusCode::OK, json!({"success": true, "data": orders})),
        Err(err) => engine_error_response(err),
    }
}

async fn handle_patch_order(
    req: Request<Body>,
    ctx: &Arc<AppContext>,
    admin_id: &str,
    order_id: &str,
) -> Response<Body> {
    let Ok(admin_id) = admin_id.parse::<Uuid>() else {
        return bad_request("invalid admin id");
    };
    let Ok(order_id) = order_id.parse::<Uuid>() else {
        return bad_request("invalid order id");
    };
    let update: CloseUpdate = match read_json(req).await {
        Ok(update) => update,
        Err(resp) => return *resp,
    };

    match ctx.engine.close_trade(admin_id, order_id, update) {
        Ok(outcome) => json_response(StatusCode::OK, json!({"success": true, "data": outcome})),
        Err(err) => engine_error_response(err),
    }
}

async fn handle_transaction(req: Request<Body>, ctx: &Arc<AppContext>) -> Response<Body> {
    let body: TransactionBody = match read_json(req).await {
        Ok(body) => body,
        Err(resp) => return *resp,
    };
    match ctx.engine.create_transaction(body.admin_id, body.request) {
        Ok(record) => json_response(
            StatusCode::CREATED,
            json!({"success": true, "data": record}),
        ),
        Err(err) => engine_error_response(err),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Body>,
) -> Result<T, Box<Response<Body>>> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|err| Box::new(bad_request(&format!("unreadable body: {err}"))))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| Box::new(bad_request(&format!("malformed body: {err}"))))
}

fn engine_error_response(err: EngineError) -> Response<Body> {
    let status = match &err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        EngineError::Validation(_) | EngineError::InsufficientBalance(_) => {
            StatusCode::BAD_REQUEST
        }
        EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::Upstream(_) => StatusCode::BAD_GATEWAY,
        EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_response(
        status,
        json!({"success": false, "error": err.to_string()}),
    )
}

fn bad_request(message: &str) -> Response<Body> {
    json_response(
        StatusCode::BAD_REQUEST,
        json!({"success": false, "error": message}),
    )
}

fn json_response(status: StatusCode, value: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}

fn twiml_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/xml")
        .body(Body::from(EMPTY_TWIML))
        .unwrap()
}
