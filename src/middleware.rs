use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use actix_web::{
    body::{BoxBody, MessageBody},
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http, web, Error, HttpMessage, ResponseError,
};
use futures::future::{ok, Ready};
use log::debug;

use crate::app_state::AppState;
use crate::auth::authenticate_token;

/// Resolves `Authorization: Bearer <token>` into an
/// [`AuthenticatedUser`](crate::auth::AuthenticatedUser) request extension.
/// A bad token is rejected here; a missing one is left for the handler.
#[derive(Debug)]
pub struct Authentication;

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = AuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddleware { service })
    }
}

pub struct AuthMiddleware<S> {
    service: S,
}

fn bearer_token(req: &ServiceRequest) -> Option<String> {
    let value = req.headers().get(http::header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if let Some(token) = bearer_token(&req) {
            let verdict = req
                .app_data::<web::Data<AppState>>()
                .map(|state| authenticate_token(&token, state));
            match verdict {
                Some(Ok(user)) => {
                    req.extensions_mut().insert(user);
                }
                Some(Err(e)) => {
                    debug!("Rejected request to {}: {}", req.path(), e);
                    let (req_parts, _payload) = req.into_parts();
                    let srv_resp = ServiceResponse::new(req_parts, e.error_response());
                    return Box::pin(async move { Ok(srv_resp) });
                }
                None => {}
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            Ok(res.map_into_boxed_body())
        })
    }
}
