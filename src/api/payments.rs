// src/api/payments.rs

use actix_web::web::ReqData;
use actix_web::{get, post, web, HttpResponse};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::AppResult;
use crate::models::AuthUser;
use crate::pricing::{CreditPack, ModelPrice, CREDIT_PACKS, CURRENCY, DEFAULT_MODEL, MODEL_PRICING};
use crate::workflow::CheckoutLink;
use crate::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct PricingResponse {
    pub currency: String,
    pub default_model: String,
    pub models: Vec<ModelPrice>,
    pub credit_packs: Vec<CreditPack>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreditBalance {
    pub credits: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseCreditsRequest {
    /// `pack_10` or `pack_25`.
    pub pack_id: String,
}

pub fn pricing_table() -> PricingResponse {
    PricingResponse {
        currency: CURRENCY.to_string(),
        default_model: DEFAULT_MODEL.to_string(),
        models: MODEL_PRICING.to_vec(),
        credit_packs: CREDIT_PACKS.to_vec(),
    }
}

#[utoipa::path(
    get,
    path = "/api/pricing",
    tag = "billing",
    responses((status = 200, description = "Model prices and credit packs", body = PricingResponse))
)]
#[get("/api/pricing")]
pub async fn pricing() -> HttpResponse {
    HttpResponse::Ok().json(pricing_table())
}

#[utoipa::path(
    get,
    path = "/api/credits",
    tag = "billing",
    responses((status = 200, description = "Credit balance of the caller", body = CreditBalance)),
    security(("bearer" = []))
)]
#[get("/credits")]
pub async fn credit_balance(
    state: web::Data<AppState>,
    user: ReqData<AuthUser>,
) -> AppResult<HttpResponse> {
    let credits = state.workflow.credit_balance(user.id).await?;
    Ok(HttpResponse::Ok().json(CreditBalance { credits }))
}

#[utoipa::path(
    post,
    path = "/api/credits/purchase",
    tag = "billing",
    request_body = PurchaseCreditsRequest,
    responses(
        (status = 200, description = "Checkout URL for the pack", body = CheckoutLink),
        (status = 400, description = "Unknown pack"),
        (status = 502, description = "Payment provider error")
    ),
    security(("bearer" = []))
)]
#[post("/credits/purchase")]
pub async fn purchase_credits(
    state: web::Data<AppState>,
    user: ReqData<AuthUser>,
    payload: web::Json<PurchaseCreditsRequest>,
) -> AppResult<HttpResponse> {
    let user = user.into_inner();
    let link = state.workflow.purchase_credits(&user, &payload.pack_id).await?;
    Ok(HttpResponse::Ok().json(link))
}
