// src/main.rs
use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::Client as S3Client;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use nanobanana_studio::api::auth::JwtMiddleware;
use nanobanana_studio::api::stripe_client::StripeClient;
use nanobanana_studio::billing::PgLedger;
use nanobanana_studio::config::Config;
use nanobanana_studio::db::PgStore;
use nanobanana_studio::email::{LogOnlyNotifier, Notifier, SendGridNotifier};
use nanobanana_studio::inference::{InferenceJobClient, ReplicateClient};
use nanobanana_studio::storage::{provision_buckets, S3ObjectStore, StoragePolicy};
use nanobanana_studio::workflow::{ProjectWorkflow, Services, WorkflowSettings};
use nanobanana_studio::{api, docs, AppState};

async fn index() -> impl Responder {
    HttpResponse::Ok().body("Service ready!")
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn build_s3_client(endpoint: Option<&str>) -> S3Client {
    let region_provider = RegionProviderChain::default_provider().or_else("us-east-1");
    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(region_provider)
        .load()
        .await;
    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);

    // Allow custom S3-compatible endpoints (e.g., MinIO)
    if let Some(endpoint) = endpoint {
        s3_config_builder = s3_config_builder
            .endpoint_url(endpoint)
            .force_path_style(true);
    }

    S3Client::from_conf(s3_config_builder.build())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_logging();

    let config = Config::from_env().map_err(std::io::Error::other)?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .map_err(std::io::Error::other)?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .map_err(std::io::Error::other)?;

    let policy = StoragePolicy::default();
    let s3_client = build_s3_client(config.s3_endpoint.as_deref()).await;
    let store = Arc::new(S3ObjectStore::new(
        s3_client,
        config.s3_public_base_url.clone(),
        policy.clone(),
    ));

    // Buckets are created here once, never lazily on the request path.
    provision_buckets(store.as_ref(), &config.buckets)
        .await
        .map_err(std::io::Error::other)?;

    let notifier: Arc<dyn Notifier> = match &config.sendgrid {
        Some(sg) => Arc::new(SendGridNotifier::new(
            sg.base_url.clone(),
            sg.api_key.clone(),
            sg.from_email.clone(),
        )),
        None => {
            log::warn!("SENDGRID_API_KEY or SENDGRID_FROM_EMAIL not set, emails will only be logged");
            Arc::new(LogOnlyNotifier)
        }
    };

    let pg = Arc::new(PgStore::new(pool.clone()));
    let services = Services {
        projects: pg.clone(),
        ledger: Arc::new(PgLedger::new(pool)),
        billing_profiles: pg.clone(),
        payment_events: pg,
        store,
        inference: InferenceJobClient::new(
            Arc::new(ReplicateClient::new(
                config.replicate_api_base_url.clone(),
                config.replicate_api_token.clone(),
            )),
            config.poll_policy,
        ),
        payments: Arc::new(StripeClient::new(
            config.stripe_api_base_url.clone(),
            config.stripe_secret_key.clone(),
        )),
        notifier,
    };
    let workflow = ProjectWorkflow::new(
        services,
        WorkflowSettings {
            buckets: config.buckets.clone(),
            storage_policy: policy,
            public_base_url: config.public_base_url.clone(),
        },
    );

    let state = web::Data::new(AppState {
        workflow: Arc::new(workflow),
        webhook_secret: config.stripe_webhook_secret.clone(),
    });
    let jwt_secret = config.jwt_secret.clone();

    log::info!("listening on {}", config.bind_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/", web::get().to(index))
            .service(
                SwaggerUi::new("/docs/{_:.*}")
                    .url("/api-docs/openapi.json", docs::ApiDoc::openapi()),
            )
            // public routes
            .service(api::payments::pricing)
            .service(api::webhooks::stripe_webhook)
            // protected routes
            .service(
                web::scope("/api")
                    .wrap(JwtMiddleware::new(jwt_secret.clone()))
                    .configure(api::configure_protected),
            )
    })
    .bind(config.bind_addr.as_str())?
    .run()
    .await
}
