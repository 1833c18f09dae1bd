pub mod auth;
pub mod handlers;
pub mod payments;
pub mod stripe_client;
pub mod webhooks;

use actix_web::web;

/// Routes behind the `/api` scope; the caller wraps the scope with `JwtMiddleware`.
pub fn configure_protected(cfg: &mut web::ServiceConfig) {
    cfg.service(handlers::start_checkout)
        .service(handlers::create_with_credit)
        .service(handlers::launch_project)
        .service(handlers::list_projects)
        .service(handlers::get_project)
        .service(handlers::delete_project)
        .service(payments::credit_balance)
        .service(payments::purchase_credits);
}
