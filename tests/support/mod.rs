#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use nanobanana_studio::api::auth::issue_token;
use nanobanana_studio::api::stripe_client::{
    CheckoutSession, CheckoutSessionDetails, CheckoutSessionRequest, PaymentGateway,
};
use nanobanana_studio::billing::{next_balance, Ledger};
use nanobanana_studio::db::{BillingProfiles, PaymentEventLog, ProjectRepository};
use nanobanana_studio::email::{EmailMessage, Notifier};
use nanobanana_studio::error::{AppError, AppResult, GenerationError, PaymentGatewayError, StorageError};
use nanobanana_studio::inference::{
    GeneratedAsset, GenerationRequest, InferenceJobClient, InferenceProvider, JobOutput, JobState,
    JobStatus, PollPolicy,
};
use nanobanana_studio::models::{
    AuthUser, BillingProfile, NewProject, PaymentStatus, Project, ProjectStatus,
};
use nanobanana_studio::storage::{
    build_public_url, resolve_path_from_public_url, Buckets, ObjectStore, StoragePolicy,
};
use nanobanana_studio::webhook::signature_header;
use nanobanana_studio::workflow::{
    GenerationInput, ImageUpload, ProjectWorkflow, Services, WorkflowSettings,
};
use nanobanana_studio::AppState;

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const STORAGE_BASE_URL: &str = "https://cdn.test";
pub const APP_BASE_URL: &str = "https://studio.test";
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake-image";

// ---------------------------------------------------------------------------
// In-memory service fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryProjects {
    rows: StdMutex<Vec<Project>>,
    fail_insert: AtomicBool,
    fail_complete: AtomicBool,
}

fn database_down() -> AppError {
    AppError::Database(sqlx::Error::PoolTimedOut)
}

impl MemoryProjects {
    pub fn fail_insert(&self, fail: bool) {
        self.fail_insert.store(fail, Ordering::SeqCst);
    }

    pub fn fail_complete(&self, fail: bool) {
        self.fail_complete.store(fail, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<Project> {
        self.rows.lock().unwrap().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Project> {
        self.rows.lock().unwrap().iter().find(|p| p.id == id).cloned()
    }

    fn update<F: FnOnce(&mut Project)>(&self, id: Uuid, f: F) -> Option<Project> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.iter_mut().find(|p| p.id == id)?;
        f(row);
        row.updated_at = Utc::now();
        Some(row.clone())
    }
}

#[async_trait]
impl ProjectRepository for MemoryProjects {
    async fn insert(&self, project: NewProject) -> AppResult<Project> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(database_down());
        }
        let project = project.into_project(Uuid::new_v4(), Utc::now());
        self.rows.lock().unwrap().push(project.clone());
        Ok(project)
    }

    async fn find(&self, id: Uuid, user_id: Uuid) -> AppResult<Option<Project>> {
        Ok(self.get(id).filter(|p| p.user_id == user_id))
    }

    async fn list(&self, user_id: Uuid) -> AppResult<Vec<Project>> {
        let mut rows: Vec<Project> = self
            .all()
            .into_iter()
            .filter(|p| p.user_id == user_id)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn set_checkout_session(&self, id: Uuid, session_id: &str) -> AppResult<()> {
        self.update(id, |p| p.stripe_checkout_session_id = Some(session_id.to_string()));
        Ok(())
    }

    async fn begin_processing(&self, id: Uuid, user_id: Uuid) -> AppResult<Option<Project>> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.iter_mut().find(|p| p.id == id && p.user_id == user_id) else {
            return Ok(None);
        };
        let launchable = matches!(row.status, ProjectStatus::Pending | ProjectStatus::Failed)
            && row.payment_status == PaymentStatus::Paid;
        if !launchable {
            return Ok(None);
        }
        row.status = ProjectStatus::Processing;
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn mark_completed(&self, id: Uuid, output_image_url: &str) -> AppResult<Project> {
        if self.fail_complete.load(Ordering::SeqCst) {
            return Err(database_down());
        }
        self.update(id, |p| {
            p.status = ProjectStatus::Completed;
            p.output_image_url = Some(output_image_url.to_string());
        })
        .ok_or(AppError::NotFound)
    }

    async fn mark_failed(&self, id: Uuid) -> AppResult<()> {
        self.update(id, |p| {
            if p.status != ProjectStatus::Completed {
                p.status = ProjectStatus::Failed;
            }
        });
        Ok(())
    }

    async fn mark_paid(
        &self,
        id: Uuid,
        session_id: &str,
        payment_intent_id: Option<&str>,
    ) -> AppResult<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows
            .iter_mut()
            .find(|p| p.id == id && p.payment_status != PaymentStatus::NotRequired)
        else {
            return Ok(false);
        };
        row.payment_status = PaymentStatus::Paid;
        row.stripe_checkout_session_id = Some(session_id.to_string());
        row.stripe_payment_intent_id = payment_intent_id.map(str::to_string);
        Ok(true)
    }

    async fn delete(&self, id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|p| !(p.id == id && p.user_id == user_id));
        Ok(rows.len() < before)
    }

    async fn delete_by_id(&self, id: Uuid) -> AppResult<bool> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|p| p.id != id);
        Ok(rows.len() < before)
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    balances: StdMutex<HashMap<Uuid, i32>>,
}

impl MemoryLedger {
    pub fn set(&self, user_id: Uuid, credits: i32) {
        self.balances.lock().unwrap().insert(user_id, credits);
    }

    pub fn get(&self, user_id: Uuid) -> Option<i32> {
        self.balances.lock().unwrap().get(&user_id).copied()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn ensure_account(&self, user_id: Uuid) -> AppResult<()> {
        self.balances.lock().unwrap().entry(user_id).or_insert(0);
        Ok(())
    }

    async fn adjust(&self, user_id: Uuid, delta: i32) -> AppResult<i32> {
        let mut balances = self.balances.lock().unwrap();
        let current = balances.get_mut(&user_id).ok_or(AppError::NotFound)?;
        *current = next_balance(*current, delta)?;
        Ok(*current)
    }

    async fn balance(&self, user_id: Uuid) -> AppResult<i32> {
        Ok(self.get(user_id).unwrap_or(0))
    }
}

#[derive(Default)]
pub struct MemoryBillingProfiles {
    rows: StdMutex<Vec<BillingProfile>>,
}

impl MemoryBillingProfiles {
    pub fn add(&self, profile: BillingProfile) {
        self.rows.lock().unwrap().push(profile);
    }

    pub fn count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl BillingProfiles for MemoryBillingProfiles {
    async fn find_by_user(&self, user_id: Uuid) -> AppResult<Option<BillingProfile>> {
        Ok(self.rows.lock().unwrap().iter().find(|p| p.user_id == user_id).cloned())
    }

    async fn find_by_customer(&self, customer_id: &str) -> AppResult<Option<BillingProfile>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.stripe_customer_id == customer_id)
            .cloned())
    }

    async fn insert_if_absent(&self, profile: BillingProfile) -> AppResult<BillingProfile> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows.iter().find(|p| p.user_id == profile.user_id) {
            return Ok(existing.clone());
        }
        rows.push(profile.clone());
        Ok(profile)
    }
}

#[derive(Default)]
pub struct MemoryEventLog {
    claimed: StdMutex<HashSet<String>>,
}

impl MemoryEventLog {
    pub fn contains(&self, event_id: &str) -> bool {
        self.claimed.lock().unwrap().contains(event_id)
    }
}

#[async_trait]
impl PaymentEventLog for MemoryEventLog {
    async fn claim(&self, event_id: &str, _event_type: &str) -> AppResult<bool> {
        Ok(self.claimed.lock().unwrap().insert(event_id.to_string()))
    }

    async fn release(&self, event_id: &str) -> AppResult<()> {
        self.claimed.lock().unwrap().remove(event_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: StdMutex<HashMap<(String, String), Vec<u8>>>,
    buckets: StdMutex<Vec<String>>,
    failing_bucket: StdMutex<Option<String>>,
}

impl MemoryObjectStore {
    /// Makes every `put` into `bucket` fail.
    pub fn fail_puts_to(&self, bucket: &str) {
        *self.failing_bucket.lock().unwrap() = Some(bucket.to_string());
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn keys_in(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn buckets(&self) -> Vec<String> {
        self.buckets.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let mut buckets = self.buckets.lock().unwrap();
        if !buckets.iter().any(|b| b == bucket) {
            buckets.push(bucket.to_string());
        }
        Ok(())
    }

    async fn put(
        &self,
        bucket: &str,
        path: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        if self.failing_bucket.lock().unwrap().as_deref() == Some(bucket) {
            return Err(StorageError::Backend(format!("put {bucket}/{path}: unavailable")));
        }
        StoragePolicy::default().check(content_type, data.len())?;
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), path.to_string()), data);
        Ok(path.to_string())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        build_public_url(STORAGE_BASE_URL, bucket, path)
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<(), StorageError> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), path.to_string()));
        Ok(())
    }

    fn path_from_public_url(&self, bucket: &str, url: &str) -> Option<String> {
        resolve_path_from_public_url(STORAGE_BASE_URL, bucket, url)
    }
}

#[derive(Debug, Clone)]
pub enum JobScript {
    Succeed(String),
    Fail(String),
    Stall,
}

pub struct ScriptedInference {
    script: StdMutex<JobScript>,
    requests: StdMutex<Vec<GenerationRequest>>,
    fail_download: AtomicBool,
}

impl Default for ScriptedInference {
    fn default() -> Self {
        Self {
            script: StdMutex::new(JobScript::Succeed(
                "https://replicate.delivery/pbxt/output.png".to_string(),
            )),
            requests: StdMutex::new(Vec::new()),
            fail_download: AtomicBool::new(false),
        }
    }
}

impl ScriptedInference {
    pub fn set(&self, script: JobScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn fail_download(&self, fail: bool) {
        self.fail_download.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceProvider for ScriptedInference {
    async fn create_job(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(format!("job-{}", Uuid::new_v4()))
    }

    async fn job_status(&self, _job_id: &str) -> Result<JobStatus, GenerationError> {
        let script = self.script.lock().unwrap().clone();
        Ok(match script {
            JobScript::Succeed(url) => JobStatus {
                status: JobState::Succeeded,
                output: Some(JobOutput::Many(vec![url])),
                error: None,
            },
            JobScript::Fail(message) => JobStatus {
                status: JobState::Failed,
                output: None,
                error: Some(message),
            },
            JobScript::Stall => JobStatus {
                status: JobState::Processing,
                output: None,
                error: None,
            },
        })
    }

    async fn download(&self, url: &str) -> Result<GeneratedAsset, GenerationError> {
        if self.fail_download.load(Ordering::SeqCst) {
            return Err(GenerationError::ProviderFailure(format!(
                "download output status=404 url={url}"
            )));
        }
        Ok(GeneratedAsset {
            data: b"generated-image".to_vec(),
            content_type: "image/png".to_string(),
        })
    }
}

#[derive(Default)]
pub struct FakeGateway {
    customers: StdMutex<Vec<(Uuid, Option<String>)>>,
    sessions: StdMutex<Vec<CheckoutSessionRequest>>,
    details: StdMutex<HashMap<String, CheckoutSessionDetails>>,
    fail_checkout: StdMutex<bool>,
}

impl FakeGateway {
    pub fn customers(&self) -> Vec<(Uuid, Option<String>)> {
        self.customers.lock().unwrap().clone()
    }

    pub fn sessions(&self) -> Vec<CheckoutSessionRequest> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn fail_checkout(&self, fail: bool) {
        *self.fail_checkout.lock().unwrap() = fail;
    }

    /// Makes `retrieve_session` report the session as paid for `project_id`.
    pub fn mark_session_paid(&self, session_id: &str, project_id: Uuid) {
        self.details.lock().unwrap().insert(
            session_id.to_string(),
            CheckoutSessionDetails {
                id: session_id.to_string(),
                payment_status: "paid".to_string(),
                payment_intent: Some("pi_reconciled".to_string()),
                customer: None,
                metadata: BTreeMap::from([("project_id".to_string(), project_id.to_string())]),
            },
        );
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_customer(
        &self,
        user_id: Uuid,
        email: Option<&str>,
    ) -> Result<String, PaymentGatewayError> {
        let mut customers = self.customers.lock().unwrap();
        customers.push((user_id, email.map(str::to_string)));
        Ok(format!("cus_test_{}", customers.len()))
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, PaymentGatewayError> {
        if *self.fail_checkout.lock().unwrap() {
            return Err(PaymentGatewayError::Api {
                status: 500,
                body: "stripe unavailable".to_string(),
            });
        }
        let mut sessions = self.sessions.lock().unwrap();
        sessions.push(request.clone());
        let id = format!("cs_test_{}", sessions.len());
        Ok(CheckoutSession {
            url: Some(format!("https://checkout.stripe.test/{id}")),
            id,
        })
    }

    async fn retrieve_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSessionDetails, PaymentGatewayError> {
        Ok(self
            .details
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| CheckoutSessionDetails {
                id: session_id.to_string(),
                payment_status: "unpaid".to_string(),
                payment_intent: None,
                customer: None,
                metadata: BTreeMap::new(),
            }))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: StdMutex<Vec<EmailMessage>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &EmailMessage) -> AppResult<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn test_buckets() -> Buckets {
    Buckets {
        input: "input-images".to_string(),
        output: "output-images".to_string(),
    }
}

pub fn fast_poll_policy() -> PollPolicy {
    PollPolicy {
        max_attempts: 3,
        interval: Duration::ZERO,
    }
}

pub struct Harness {
    pub projects: Arc<MemoryProjects>,
    pub ledger: Arc<MemoryLedger>,
    pub profiles: Arc<MemoryBillingProfiles>,
    pub events: Arc<MemoryEventLog>,
    pub store: Arc<MemoryObjectStore>,
    pub inference: Arc<ScriptedInference>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub workflow: Arc<ProjectWorkflow>,
}

impl Harness {
    pub fn new() -> Self {
        let projects = Arc::new(MemoryProjects::default());
        let ledger = Arc::new(MemoryLedger::default());
        let profiles = Arc::new(MemoryBillingProfiles::default());
        let events = Arc::new(MemoryEventLog::default());
        let store = Arc::new(MemoryObjectStore::default());
        let inference = Arc::new(ScriptedInference::default());
        let gateway = Arc::new(FakeGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let services = Services {
            projects: projects.clone(),
            ledger: ledger.clone(),
            billing_profiles: profiles.clone(),
            payment_events: events.clone(),
            store: store.clone(),
            inference: InferenceJobClient::new(inference.clone(), fast_poll_policy()),
            payments: gateway.clone(),
            notifier: notifier.clone(),
        };
        let workflow = Arc::new(ProjectWorkflow::new(
            services,
            WorkflowSettings {
                buckets: test_buckets(),
                storage_policy: StoragePolicy::default(),
                public_base_url: APP_BASE_URL.to_string(),
            },
        ));

        Self {
            projects,
            ledger,
            profiles,
            events,
            store,
            inference,
            gateway,
            notifier,
            workflow,
        }
    }

    pub fn state(&self) -> AppState {
        AppState {
            workflow: self.workflow.clone(),
            webhook_secret: WEBHOOK_SECRET.to_string(),
        }
    }

    /// A paid, pending project owned by `user`, created through the checkout path.
    pub async fn paid_project(&self, user: &AuthUser) -> Project {
        let started = self
            .workflow
            .start_checkout(user, generation_input("neon poster"))
            .await
            .expect("checkout");
        let project = self.projects.get(started.project_id).expect("project row");
        let session_id = project
            .stripe_checkout_session_id
            .clone()
            .expect("session id");
        self.projects
            .mark_paid(project.id, &session_id, Some("pi_test"))
            .await
            .expect("mark paid");
        self.projects.get(project.id).expect("project row")
    }
}

pub fn user() -> AuthUser {
    let id = Uuid::new_v4();
    AuthUser {
        id,
        email: Some(format!("user-{id}@example.com")),
    }
}

pub fn token_for(user: &AuthUser) -> String {
    issue_token(JWT_SECRET, user, chrono::Duration::hours(1)).expect("token")
}

pub fn bearer(user: &AuthUser) -> (&'static str, String) {
    ("Authorization", format!("Bearer {}", token_for(user)))
}

pub fn generation_input(prompt: &str) -> GenerationInput {
    GenerationInput {
        image: Some(ImageUpload {
            data: PNG_BYTES.to_vec(),
            content_type: "image/png".to_string(),
        }),
        prompt: prompt.to_string(),
        model_key: "google/nano-banana".to_string(),
    }
}

pub fn signed_header(payload: &[u8]) -> String {
    signature_header(WEBHOOK_SECRET, Utc::now().timestamp(), payload)
}

const BOUNDARY: &str = "----studio-test-boundary";

/// Builds a `multipart/form-data` body; returns the content type header value and the body.
pub fn multipart_body(
    image: Option<(&str, &[u8])>,
    fields: &[(&str, &str)],
) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    if let Some((content_type, data)) = image {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"input.png\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={BOUNDARY}"), body)
}

// ---------------------------------------------------------------------------
// Postgres bootstrap for the #[ignore]d database tests
// ---------------------------------------------------------------------------

fn split_db_url(url: &str) -> Result<(String, String), String> {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base.to_string(), Some(query)),
        None => (url.to_string(), None),
    };

    let db_start = base
        .rfind('/')
        .ok_or_else(|| "invalid database url".to_string())?;
    if db_start + 1 >= base.len() {
        return Err("database name is empty".to_string());
    }

    let db_name = base[db_start + 1..].to_string();
    let mut admin_url = format!("{}postgres", &base[..db_start + 1]);
    if let Some(query) = query {
        admin_url = format!("{admin_url}?{query}");
    }

    Ok((admin_url, db_name))
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

static TEST_DB_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub struct TestDb {
    pub pool: PgPool,
    _guard: MutexGuard<'static, ()>,
}

/// Recreates the database named in `TEST_DATABASE_URL` and runs migrations.
pub async fn init_test_db() -> TestDb {
    dotenvy::dotenv().ok();
    let test_url = env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    let (admin_url, db_name) = split_db_url(&test_url).expect("invalid TEST_DATABASE_URL format");

    let lock = TEST_DB_LOCK.get_or_init(|| Mutex::new(()));
    let guard = lock.lock().await;

    let admin_pool = PgPool::connect(&admin_url).await.expect("connect admin db");

    let quoted_name = quote_identifier(&db_name);
    let _ = sqlx::query(&format!("DROP DATABASE IF EXISTS {quoted_name} WITH (FORCE)"))
        .execute(&admin_pool)
        .await;
    sqlx::query(&format!("CREATE DATABASE {quoted_name}"))
        .execute(&admin_pool)
        .await
        .expect("create test db");
    admin_pool.close().await;

    let pool = PgPool::connect(&test_url).await.expect("connect test db");
    sqlx::migrate!().run(&pool).await.expect("migrations");
    TestDb { pool, _guard: guard }
}
