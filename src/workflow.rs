// src/workflow.rs
//
// Project lifecycle: paid checkout with deferred launch, credit-funded
// generation with compensation, deletion and payment event application.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::stripe_client::{CheckoutSessionRequest, PaymentGateway};
use crate::billing::Ledger;
use crate::db::{BillingProfiles, PaymentEventLog, ProjectRepository};
use crate::email::{EmailMessage, Notifier};
use crate::error::{AppError, AppResult};
use crate::inference::{GenerationRequest, InferenceJobClient};
use crate::models::{AuthUser, BillingProfile, NewProject, PaymentStatus, Project, ProjectStatus};
use crate::pricing::{self, ModelPrice, CURRENCY, DEFAULT_MODEL};
use crate::storage::{object_path, Buckets, ObjectStore, StoragePolicy};
use crate::webhook::PaymentEvent;

#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// Raw generation form as submitted by the user.
#[derive(Debug, Clone, Default)]
pub struct GenerationInput {
    pub image: Option<ImageUpload>,
    pub prompt: String,
    pub model_key: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutStarted {
    pub project_id: Uuid,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutLink {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CreditGeneration {
    pub project: Project,
    pub credits_remaining: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    Duplicate,
    Ignored,
}

/// Handles to every external collaborator.
#[derive(Clone)]
pub struct Services {
    pub projects: Arc<dyn ProjectRepository>,
    pub ledger: Arc<dyn Ledger>,
    pub billing_profiles: Arc<dyn BillingProfiles>,
    pub payment_events: Arc<dyn PaymentEventLog>,
    pub store: Arc<dyn ObjectStore>,
    pub inference: InferenceJobClient,
    pub payments: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub buckets: Buckets,
    pub storage_policy: StoragePolicy,
    pub public_base_url: String,
}

struct ValidatedInput {
    image: ImageUpload,
    prompt: String,
    model: &'static ModelPrice,
}

/// What a credit-funded attempt has created so far.
#[derive(Default)]
struct CreditAttempt {
    project_id: Option<Uuid>,
    uploaded: Vec<(String, String)>,
}

pub struct ProjectWorkflow {
    services: Services,
    settings: WorkflowSettings,
}

impl ProjectWorkflow {
    pub fn new(services: Services, settings: WorkflowSettings) -> Self {
        Self { services, settings }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    fn validate(&self, input: GenerationInput) -> AppResult<ValidatedInput> {
        let model_key = match input.model_key.trim() {
            "" => DEFAULT_MODEL,
            key => key,
        };
        let model = pricing::model_price(model_key)
            .ok_or_else(|| AppError::Validation("unsupported model".into()))?;

        let image = input
            .image
            .filter(|i| !i.data.is_empty())
            .ok_or_else(|| AppError::Validation("no image received".into()))?;

        self.settings
            .storage_policy
            .check(&image.content_type, image.data.len())
            .map_err(|e| AppError::Validation(e.to_string()))?;

        let prompt = input.prompt.trim();
        if prompt.is_empty() {
            return Err(AppError::Validation("prompt is required".into()));
        }

        Ok(ValidatedInput {
            image,
            prompt: prompt.to_string(),
            model,
        })
    }

    async fn upload_input(&self, image: ImageUpload) -> AppResult<(String, String)> {
        let bucket = &self.settings.buckets.input;
        let path = object_path("uploads", &image.content_type);
        self.services
            .store
            .put(bucket, &path, image.data, &image.content_type)
            .await?;
        let url = self.services.store.public_url(bucket, &path);
        Ok((path, url))
    }

    /// Runs inference, then copies the result into the output bucket and returns its public URL.
    async fn generate_and_store(
        &self,
        request: &GenerationRequest,
        uploaded: &mut Vec<(String, String)>,
    ) -> AppResult<String> {
        let result_url = self.services.inference.submit(request).await?;
        let asset = self.services.inference.download(&result_url).await?;

        let bucket = &self.settings.buckets.output;
        let path = object_path("generated", &asset.content_type);
        self.services
            .store
            .put(bucket, &path, asset.data, &asset.content_type)
            .await?;
        uploaded.push((bucket.clone(), path.clone()));

        Ok(self.services.store.public_url(bucket, &path))
    }

    async fn remove_objects(&self, objects: &[(String, String)]) {
        let deletes = objects.iter().map(|(bucket, path)| async move {
            if let Err(e) = self.services.store.delete(bucket, path).await {
                log::warn!("object delete failed bucket={} path={} error={}", bucket, path, e);
            }
        });
        join_all(deletes).await;
    }

    async fn ensure_billing_customer(&self, user: &AuthUser) -> AppResult<String> {
        if let Some(profile) = self.services.billing_profiles.find_by_user(user.id).await? {
            return Ok(profile.stripe_customer_id);
        }

        let customer_id = self
            .services
            .payments
            .create_customer(user.id, user.email.as_deref())
            .await?;

        let stored = self
            .services
            .billing_profiles
            .insert_if_absent(BillingProfile {
                user_id: user.id,
                stripe_customer_id: customer_id,
                email: user.email.clone(),
            })
            .await?;

        log::info!(
            "billing profile ready user_id={} customer_id={}",
            user.id,
            stored.stripe_customer_id
        );
        Ok(stored.stripe_customer_id)
    }

    fn base_url(&self) -> &str {
        self.settings.public_base_url.trim_end_matches('/')
    }

    /// Path A: stores the input, creates a pending project and returns a checkout URL.
    /// Generation waits for payment and an explicit launch.
    pub async fn start_checkout(
        &self,
        user: &AuthUser,
        input: GenerationInput,
    ) -> AppResult<CheckoutStarted> {
        let input = self.validate(input)?;

        self.services.ledger.ensure_account(user.id).await?;
        let customer_id = self.ensure_billing_customer(user).await?;

        let (input_path, input_url) = self.upload_input(input.image).await?;

        let inserted = self
            .services
            .projects
            .insert(NewProject {
                user_id: user.id,
                input_image_url: input_url,
                prompt: input.prompt,
                model_key: input.model.key.to_string(),
                status: ProjectStatus::Pending,
                payment_status: PaymentStatus::Pending,
                payment_amount: input.model.amount_cents,
            })
            .await;
        let project = match inserted {
            Ok(project) => project,
            Err(e) => {
                log::error!("checkout project insert failed user_id={} error={}", user.id, e);
                self.remove_objects(&[(self.settings.buckets.input.clone(), input_path)])
                    .await;
                return Err(e);
            }
        };

        let metadata = BTreeMap::from([
            ("project_id".to_string(), project.id.to_string()),
            ("model_key".to_string(), input.model.key.to_string()),
            ("price_cents".to_string(), input.model.amount_cents.to_string()),
        ]);
        let request = CheckoutSessionRequest {
            customer_id,
            amount_cents: input.model.amount_cents,
            currency: CURRENCY.to_string(),
            product_name: format!("AI generation - {}", input.model.key),
            success_url: format!("{}/dashboard?session_id={{CHECKOUT_SESSION_ID}}", self.base_url()),
            cancel_url: format!("{}/dashboard", self.base_url()),
            metadata,
        };

        let session = match self.services.payments.create_checkout_session(&request).await {
            Ok(session) => session,
            Err(e) => {
                log::error!("checkout session failed project_id={} error={}", project.id, e);
                if let Err(mark_err) = self.services.projects.mark_failed(project.id).await {
                    log::error!("mark failed error project_id={} error={}", project.id, mark_err);
                }
                return Err(e.into());
            }
        };

        self.services
            .projects
            .set_checkout_session(project.id, &session.id)
            .await?;

        log::info!(
            "checkout started project_id={} user_id={} session_id={}",
            project.id,
            user.id,
            session.id
        );
        Ok(CheckoutStarted {
            project_id: project.id,
            url: session.url,
        })
    }

    /// Confirms payment with the gateway when the webhook has not arrived yet.
    async fn confirm_payment(&self, project: &Project) -> AppResult<()> {
        let Some(session_id) = project.stripe_checkout_session_id.clone() else {
            return Err(AppError::PaymentRequired);
        };

        let session = self.services.payments.retrieve_session(&session_id).await?;
        let project_id = project.id.to_string();
        if !session.is_paid() || session.metadata.get("project_id") != Some(&project_id) {
            return Err(AppError::PaymentRequired);
        }

        self.services
            .projects
            .mark_paid(project.id, &session.id, session.payment_intent.as_deref())
            .await?;
        log::info!("payment confirmed on launch project_id={} session_id={}", project.id, session.id);
        Ok(())
    }

    /// Path A: runs generation for a paid project owned by `user_id`.
    pub async fn launch(&self, user_id: Uuid, project_id: Uuid) -> AppResult<Project> {
        let project = self
            .services
            .projects
            .find(project_id, user_id)
            .await?
            .ok_or(AppError::NotFound)?;

        match project.status {
            ProjectStatus::Completed => return Ok(project),
            ProjectStatus::Processing => {
                return Err(AppError::Conflict("generation already in progress".into()))
            }
            ProjectStatus::Pending | ProjectStatus::Failed => {}
        }

        if project.payment_status != PaymentStatus::Paid {
            self.confirm_payment(&project).await?;
        }

        let project = self
            .services
            .projects
            .begin_processing(project_id, user_id)
            .await?
            .ok_or_else(|| AppError::Conflict("project cannot be launched".into()))?;

        log::info!("launch project_id={} user_id={}", project.id, user_id);

        let request = GenerationRequest::new(&project.prompt, &project.model_key)
            .with_fallback_url(&project.input_image_url);
        let mut uploaded = Vec::new();

        let result = match self.generate_and_store(&request, &mut uploaded).await {
            Ok(output_url) => self.services.projects.mark_completed(project.id, &output_url).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(project) => {
                log::info!("project completed project_id={}", project.id);
                Ok(project)
            }
            Err(e) => {
                log::error!("launch failed project_id={} error={}", project.id, e);
                if let Err(mark_err) = self.services.projects.mark_failed(project.id).await {
                    log::error!("mark failed error project_id={} error={}", project.id, mark_err);
                }
                self.remove_objects(&uploaded).await;
                Err(e)
            }
        }
    }

    /// Path B: spends one credit and generates immediately. Any failure after the
    /// debit refunds the credit and removes what was created.
    pub async fn generate_with_credit(
        &self,
        user_id: Uuid,
        input: GenerationInput,
    ) -> AppResult<CreditGeneration> {
        let input = self.validate(input)?;

        self.services.ledger.ensure_account(user_id).await?;
        let credits_remaining = self.services.ledger.adjust(user_id, -1).await?;
        log::info!("credit spent user_id={} balance={}", user_id, credits_remaining);

        let mut attempt = CreditAttempt::default();
        match self.run_credit_generation(user_id, input, &mut attempt).await {
            Ok(project) => {
                log::info!("project completed project_id={} user_id={}", project.id, user_id);
                Ok(CreditGeneration {
                    project,
                    credits_remaining,
                })
            }
            Err(e) => {
                log::error!("credit generation failed user_id={} error={}", user_id, e);
                self.compensate(user_id, attempt).await;
                Err(e)
            }
        }
    }

    async fn run_credit_generation(
        &self,
        user_id: Uuid,
        input: ValidatedInput,
        attempt: &mut CreditAttempt,
    ) -> AppResult<Project> {
        let request = GenerationRequest::new(&input.prompt, input.model.key)
            .with_inline_image(&input.image.data, &input.image.content_type);

        let (input_path, input_url) = self.upload_input(input.image).await?;
        attempt
            .uploaded
            .push((self.settings.buckets.input.clone(), input_path));

        let project = self
            .services
            .projects
            .insert(NewProject {
                user_id,
                input_image_url: input_url.clone(),
                prompt: input.prompt,
                model_key: input.model.key.to_string(),
                status: ProjectStatus::Processing,
                payment_status: PaymentStatus::NotRequired,
                payment_amount: 0,
            })
            .await?;
        attempt.project_id = Some(project.id);

        let request = request.with_fallback_url(input_url);
        let output_url = self
            .generate_and_store(&request, &mut attempt.uploaded)
            .await?;

        self.services.projects.mark_completed(project.id, &output_url).await
    }

    async fn compensate(&self, user_id: Uuid, attempt: CreditAttempt) {
        match self.services.ledger.adjust(user_id, 1).await {
            Ok(balance) => log::info!("credit refunded user_id={} balance={}", user_id, balance),
            Err(e) => log::error!("credit refund failed user_id={} error={}", user_id, e),
        }

        if let Some(project_id) = attempt.project_id {
            if let Err(e) = self.services.projects.delete_by_id(project_id).await {
                log::error!("project cleanup failed project_id={} error={}", project_id, e);
            }
        }

        self.remove_objects(&attempt.uploaded).await;
    }

    /// Removes stored assets (best effort) and the project row.
    pub async fn delete_project(&self, user_id: Uuid, project_id: Uuid) -> AppResult<()> {
        let project = self
            .services
            .projects
            .find(project_id, user_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let buckets = &self.settings.buckets;
        let objects: Vec<(String, String)> = [
            (&buckets.input, Some(project.input_image_url.as_str())),
            (&buckets.output, project.output_image_url.as_deref()),
        ]
        .into_iter()
        .filter_map(|(bucket, url)| {
            let path = self.services.store.path_from_public_url(bucket, url?)?;
            Some((bucket.clone(), path))
        })
        .collect();

        self.remove_objects(&objects).await;

        if !self.services.projects.delete(project_id, user_id).await? {
            return Err(AppError::NotFound);
        }

        log::info!("project deleted project_id={} user_id={}", project_id, user_id);
        Ok(())
    }

    pub async fn list_projects(&self, user_id: Uuid) -> AppResult<Vec<Project>> {
        self.services.projects.list(user_id).await
    }

    pub async fn get_project(&self, user_id: Uuid, project_id: Uuid) -> AppResult<Project> {
        self.services
            .projects
            .find(project_id, user_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn credit_balance(&self, user_id: Uuid) -> AppResult<i32> {
        self.services.ledger.balance(user_id).await
    }

    /// Creates a checkout session for a credit pack; credits arrive with the webhook.
    pub async fn purchase_credits(&self, user: &AuthUser, pack_id: &str) -> AppResult<CheckoutLink> {
        let pack = pricing::credit_pack(pack_id)
            .ok_or_else(|| AppError::Validation("unknown credit pack".into()))?;

        self.services.ledger.ensure_account(user.id).await?;
        let customer_id = self.ensure_billing_customer(user).await?;

        let request = CheckoutSessionRequest {
            customer_id,
            amount_cents: pack.amount_cents,
            currency: CURRENCY.to_string(),
            product_name: pack.name.to_string(),
            success_url: format!("{}/billing?pack_session={{CHECKOUT_SESSION_ID}}", self.base_url()),
            cancel_url: format!("{}/billing", self.base_url()),
            metadata: BTreeMap::from([
                ("credits_pack_size".to_string(), pack.credits.to_string()),
                ("pack_id".to_string(), pack.id.to_string()),
            ]),
        };

        let session = self.services.payments.create_checkout_session(&request).await?;
        log::info!(
            "credit pack checkout user_id={} pack_id={} session_id={}",
            user.id,
            pack.id,
            session.id
        );
        Ok(CheckoutLink { url: session.url })
    }

    /// Applies a verified payment event at most once.
    pub async fn handle_payment_event(&self, event: PaymentEvent) -> AppResult<EventOutcome> {
        if let PaymentEvent::Ignored { event_id, kind } = &event {
            log::info!("payment event ignored event_id={} type={}", event_id, kind);
            return Ok(EventOutcome::Ignored);
        }

        let event_id = event.event_id().to_string();
        if !self
            .services
            .payment_events
            .claim(&event_id, event.kind())
            .await?
        {
            log::info!("payment event already processed event_id={}", event_id);
            return Ok(EventOutcome::Duplicate);
        }

        match self.apply_payment_event(event).await {
            Ok(()) => Ok(EventOutcome::Applied),
            Err(e) => {
                if let Err(release_err) = self.services.payment_events.release(&event_id).await {
                    log::error!("payment event release failed event_id={} error={}", event_id, release_err);
                }
                Err(e)
            }
        }
    }

    async fn user_for_customer(&self, customer_id: Option<&str>) -> AppResult<Option<BillingProfile>> {
        let Some(customer_id) = customer_id else {
            return Ok(None);
        };
        let profile = self.services.billing_profiles.find_by_customer(customer_id).await?;
        if profile.is_none() {
            log::warn!("no billing profile for customer_id={}", customer_id);
        }
        Ok(profile)
    }

    async fn notify(&self, profile: Option<BillingProfile>, message: fn(&str) -> EmailMessage) {
        let Some(email) = profile.and_then(|p| p.email) else {
            return;
        };
        if let Err(e) = self.services.notifier.send(&message(&email)).await {
            log::error!("notification failed to={} error={}", email, e);
        }
    }

    async fn apply_payment_event(&self, event: PaymentEvent) -> AppResult<()> {
        match event {
            PaymentEvent::ProjectPaid {
                session_id,
                project_id,
                payment_intent_id,
                ..
            } => {
                let found = self
                    .services
                    .projects
                    .mark_paid(project_id, &session_id, payment_intent_id.as_deref())
                    .await?;
                if found {
                    log::info!("project paid project_id={} session_id={}", project_id, session_id);
                } else {
                    log::warn!("paid session for unknown project project_id={}", project_id);
                }
            }
            PaymentEvent::CreditPackPaid {
                customer_id,
                credits,
                pack_id,
                ..
            } => {
                if let Some(profile) = self.user_for_customer(customer_id.as_deref()).await? {
                    self.services.ledger.ensure_account(profile.user_id).await?;
                    let balance = self.services.ledger.adjust(profile.user_id, credits).await?;
                    log::info!(
                        "credit pack granted user_id={} pack_id={:?} credits={} balance={}",
                        profile.user_id,
                        pack_id,
                        credits,
                        balance
                    );
                }
            }
            PaymentEvent::PaymentFailed { customer_id, .. } => {
                let profile = self.user_for_customer(customer_id.as_deref()).await?;
                self.notify(profile, EmailMessage::payment_failed).await;
            }
            PaymentEvent::SubscriptionCancelled { customer_id, .. } => {
                let profile = self.user_for_customer(customer_id.as_deref()).await?;
                self.notify(profile, EmailMessage::subscription_cancelled).await;
            }
            PaymentEvent::Ignored { .. } => {}
        }
        Ok(())
    }
}
