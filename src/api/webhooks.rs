// src/api/webhooks.rs

use actix_web::{post, web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::AppResult;
use crate::webhook::{parse_event, verify_signature, DEFAULT_TOLERANCE_SECS, SIGNATURE_HEADER};
use crate::workflow::EventOutcome;
use crate::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    /// `applied`, `duplicate` or `ignored`.
    pub outcome: String,
}

fn outcome_label(outcome: EventOutcome) -> &'static str {
    match outcome {
        EventOutcome::Applied => "applied",
        EventOutcome::Duplicate => "duplicate",
        EventOutcome::Ignored => "ignored",
    }
}

#[utoipa::path(
    post,
    path = "/webhooks/stripe",
    tag = "webhooks",
    request_body(content = String, content_type = "application/json", description = "Raw Stripe event"),
    params(("stripe-signature" = String, Header, description = "t=<unix>,v1=<hmac-sha256 hex>")),
    responses(
        (status = 200, description = "Event accepted", body = WebhookAck),
        (status = 400, description = "Missing or invalid signature, or malformed payload"),
        (status = 500, description = "Event could not be applied, retry later")
    )
)]
#[post("/webhooks/stripe")]
pub async fn stripe_webhook(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let header = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok());

    // Nothing is decoded or touched before the signature checks out.
    verify_signature(
        &body,
        header,
        &state.webhook_secret,
        Utc::now().timestamp(),
        DEFAULT_TOLERANCE_SECS,
    )?;

    let event = parse_event(&body)?;
    log::info!(
        "stripe webhook event_id={} type={}",
        event.event_id(),
        event.kind()
    );

    let outcome = state.workflow.handle_payment_event(event).await?;
    Ok(HttpResponse::Ok().json(WebhookAck {
        received: true,
        outcome: outcome_label(outcome).to_string(),
    }))
}
