// src/api/handlers.rs

use actix_multipart::Multipart;
use actix_web::web::ReqData;
use actix_web::{delete, get, post, web, HttpResponse};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{AuthUser, Project};
use crate::workflow::{CheckoutStarted, CreditGeneration, GenerationInput, ImageUpload};
use crate::AppState;

const MAX_TEXT_FIELD_BYTES: usize = 16 * 1024;

/// Multipart body accepted by the generation endpoints.
#[derive(Debug, Deserialize, ToSchema)]
pub struct GenerationForm {
    #[schema(value_type = String, format = Binary)]
    pub image: Vec<u8>,
    pub prompt: String,
    #[serde(rename = "modelKey")]
    pub model_key: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProjectList {
    pub projects: Vec<Project>,
}

async fn read_field(
    field: &mut actix_multipart::Field,
    limit: usize,
    name: &str,
) -> AppResult<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?;
        if data.len() + chunk.len() > limit {
            return Err(AppError::Validation(format!(
                "field {name} exceeds the {limit} byte limit"
            )));
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

/// Reads `image`, `prompt` and `modelKey` from a multipart body. Unknown fields are skipped.
pub async fn read_generation_form(
    mut payload: Multipart,
    max_image_bytes: usize,
) -> AppResult<GenerationInput> {
    let mut input = GenerationInput::default();

    while let Some(item) = payload.next().await {
        let mut field =
            item.map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?;

        // actix-multipart 0.6: content_disposition() -> &ContentDisposition
        let name = field
            .content_disposition()
            .get_name()
            .unwrap_or_default()
            .to_string();

        match name.as_str() {
            "image" => {
                let content_type = field
                    .content_type()
                    .map(|m| m.essence_str().to_string())
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                // One byte over the limit is enough for the size check to reject it.
                let data = read_field(&mut field, max_image_bytes + 1, "image").await?;
                input.image = Some(ImageUpload { data, content_type });
            }
            "prompt" | "modelKey" | "model_key" => {
                let data = read_field(&mut field, MAX_TEXT_FIELD_BYTES, &name).await?;
                let value = String::from_utf8(data)
                    .map_err(|_| AppError::Validation(format!("field {name} must be UTF-8")))?;
                if name == "prompt" {
                    input.prompt = value;
                } else {
                    input.model_key = value.trim().to_string();
                }
            }
            _ => {
                while let Some(chunk) = field.next().await {
                    chunk.map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?;
                }
            }
        }
    }

    Ok(input)
}

#[utoipa::path(
    post,
    path = "/api/projects/checkout",
    tag = "projects",
    request_body(content = GenerationForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Project created, checkout URL returned", body = CheckoutStarted),
        (status = 400, description = "Invalid input"),
        (status = 401, description = "Missing or invalid token"),
        (status = 502, description = "Payment provider error")
    ),
    security(("bearer" = []))
)]
#[post("/projects/checkout")]
pub async fn start_checkout(
    payload: Multipart,
    state: web::Data<AppState>,
    user: ReqData<AuthUser>,
) -> AppResult<HttpResponse> {
    let user = user.into_inner();
    let limit = state.workflow.settings().storage_policy.max_object_bytes;
    let input = read_generation_form(payload, limit).await?;

    let started = state.workflow.start_checkout(&user, input).await?;
    Ok(HttpResponse::Ok().json(started))
}

#[utoipa::path(
    post,
    path = "/api/projects/create-with-credit",
    tag = "projects",
    request_body(content = GenerationForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Image generated, one credit spent", body = CreditGeneration),
        (status = 400, description = "Invalid input"),
        (status = 402, description = "Insufficient credits"),
        (status = 422, description = "Content flagged by the model"),
        (status = 502, description = "Generation failed, credit refunded")
    ),
    security(("bearer" = []))
)]
#[post("/projects/create-with-credit")]
pub async fn create_with_credit(
    payload: Multipart,
    state: web::Data<AppState>,
    user: ReqData<AuthUser>,
) -> AppResult<HttpResponse> {
    let user = user.into_inner();
    let limit = state.workflow.settings().storage_policy.max_object_bytes;
    let input = read_generation_form(payload, limit).await?;

    let generated = state.workflow.generate_with_credit(user.id, input).await?;
    Ok(HttpResponse::Ok().json(generated))
}

#[utoipa::path(
    post,
    path = "/api/projects/{id}/launch",
    tag = "projects",
    params(("id" = Uuid, Path, description = "Project id")),
    responses(
        (status = 200, description = "Generation finished", body = Project),
        (status = 402, description = "Project is not paid"),
        (status = 404, description = "Project not found"),
        (status = 409, description = "Generation already in progress"),
        (status = 422, description = "Content flagged by the model")
    ),
    security(("bearer" = []))
)]
#[post("/projects/{id}/launch")]
pub async fn launch_project(
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
    user: ReqData<AuthUser>,
) -> AppResult<HttpResponse> {
    let project = state.workflow.launch(user.id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(project))
}

#[utoipa::path(
    get,
    path = "/api/projects",
    tag = "projects",
    responses((status = 200, description = "Projects of the caller, newest first", body = ProjectList)),
    security(("bearer" = []))
)]
#[get("/projects")]
pub async fn list_projects(
    state: web::Data<AppState>,
    user: ReqData<AuthUser>,
) -> AppResult<HttpResponse> {
    let projects = state.workflow.list_projects(user.id).await?;
    Ok(HttpResponse::Ok().json(ProjectList { projects }))
}

#[utoipa::path(
    get,
    path = "/api/projects/{id}",
    tag = "projects",
    params(("id" = Uuid, Path, description = "Project id")),
    responses(
        (status = 200, description = "Project", body = Project),
        (status = 404, description = "Project not found")
    ),
    security(("bearer" = []))
)]
#[get("/projects/{id}")]
pub async fn get_project(
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
    user: ReqData<AuthUser>,
) -> AppResult<HttpResponse> {
    let project = state.workflow.get_project(user.id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(project))
}

#[utoipa::path(
    delete,
    path = "/api/projects/{id}",
    tag = "projects",
    params(("id" = Uuid, Path, description = "Project id")),
    responses(
        (status = 204, description = "Project and its images deleted"),
        (status = 404, description = "Project not found")
    ),
    security(("bearer" = []))
)]
#[delete("/projects/{id}")]
pub async fn delete_project(
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
    user: ReqData<AuthUser>,
) -> AppResult<HttpResponse> {
    state.workflow.delete_project(user.id, path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}
