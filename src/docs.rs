use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::handlers::start_checkout,
        crate::api::handlers::create_with_credit,
        crate::api::handlers::launch_project,
        crate::api::handlers::list_projects,
        crate::api::handlers::get_project,
        crate::api::handlers::delete_project,
        crate::api::payments::pricing,
        crate::api::payments::credit_balance,
        crate::api::payments::purchase_credits,
        crate::api::webhooks::stripe_webhook
    ),
    components(
        schemas(
            crate::models::Project,
            crate::models::ProjectStatus,
            crate::models::PaymentStatus,
            crate::pricing::ModelPrice,
            crate::pricing::CreditPack,
            crate::api::handlers::GenerationForm,
            crate::api::handlers::ProjectList,
            crate::api::payments::PricingResponse,
            crate::api::payments::CreditBalance,
            crate::api::payments::PurchaseCreditsRequest,
            crate::api::webhooks::WebhookAck,
            crate::workflow::CheckoutStarted,
            crate::workflow::CheckoutLink,
            crate::workflow::CreditGeneration
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "projects", description = "Image generation projects"),
        (name = "billing", description = "Pricing, credits and checkout"),
        (name = "webhooks", description = "Callbacks from Stripe")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}
