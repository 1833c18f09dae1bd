pub mod api;
pub mod billing;
pub mod config;
pub mod db;
pub mod docs;
pub mod email;
pub mod error;
pub mod inference;
pub mod models;
pub mod pricing;
pub mod storage;
pub mod webhook;
pub mod workflow;

use std::sync::Arc;

use workflow::ProjectWorkflow;

#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<ProjectWorkflow>,
    pub webhook_secret: String,
}
