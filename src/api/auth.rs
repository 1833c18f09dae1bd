// src/api/auth.rs

use std::rc::Rc;
use std::task::{Context, Poll};

use actix_web::body::MessageBody;
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{Error, HttpMessage};
use chrono::{Duration, Utc};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::AuthUser;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub exp: usize,
}

/// Signs an HS256 token for `user`. Tokens are normally minted by the identity
/// provider; this is used by tooling and tests.
pub fn issue_token(
    secret: &str,
    user: &AuthUser,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let exp = (Utc::now() + ttl).timestamp().max(0) as usize;
    let claims = Claims {
        sub: user.id,
        email: user.email.clone(),
        exp,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
}

pub fn decode_token(secret: &str, token: &str) -> Result<AuthUser, AppError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::Unauthorized("invalid token".into()))?;

    Ok(AuthUser {
        id: data.claims.sub,
        email: data.claims.email,
    })
}

/// Middleware that:
/// - reads `Authorization: Bearer <jwt>`
/// - validates the JWT against the shared secret
/// - puts the `AuthUser` into `req.extensions_mut()`
#[derive(Clone)]
pub struct JwtMiddleware {
    secret: Rc<String>,
}

impl JwtMiddleware {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Rc::new(secret.into()),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for JwtMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = JwtMiddlewareInner<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(JwtMiddlewareInner {
            service,
            secret: self.secret.clone(),
        }))
    }
}

pub struct JwtMiddlewareInner<S> {
    service: S,
    secret: Rc<String>,
}

impl<S, B> Service<ServiceRequest> for JwtMiddlewareInner<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let token = req
            .headers()
            .get(actix_web::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim);

        let Some(token) = token else {
            return Box::pin(async move {
                Err(AppError::Unauthorized("missing or invalid Authorization header".into()).into())
            });
        };

        match decode_token(&self.secret, token) {
            Ok(user) => {
                req.extensions_mut().insert(user);
                let fut = self.service.call(req);
                Box::pin(async move { fut.await })
            }
            Err(e) => Box::pin(async move { Err(e.into()) }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_decode_to_the_same_user() {
        let user = AuthUser {
            id: Uuid::new_v4(),
            email: Some("ada@example.com".into()),
        };
        let token = issue_token("secret", &user, Duration::hours(1)).unwrap();
        assert_eq!(decode_token("secret", &token).unwrap(), user);
        assert!(matches!(
            decode_token("other-secret", &token),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let user = AuthUser {
            id: Uuid::new_v4(),
            email: None,
        };
        let token = issue_token("secret", &user, Duration::hours(-2)).unwrap();
        assert!(decode_token("secret", &token).is_err());
    }
}
