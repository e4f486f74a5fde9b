//! Request handler seam.
//!
//! The dispatcher hands every request to a `MessageHandler` and mails back
//! whatever content it returns. Handlers are invoked concurrently from
//! independent request tasks.

pub mod actions;

use std::future::Future;

use async_trait::async_trait;

use crate::error::Fault;
use crate::models::{Contents, User};

pub use actions::ActionRegistry;

/// Turns request content into reply content.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        user_id: &str,
        request_id: &str,
        user: &User,
        contents: Contents,
    ) -> Result<Contents, Fault>;
}

/// Owned arguments for closure-based handlers.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub user_id: String,
    pub request_id: String,
    pub user: User,
    pub contents: Contents,
}

/// Handler backed by an async closure.
pub struct FnHandler<F>(F);

/// Wrap an async closure as a `MessageHandler`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Contents, Fault>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Contents, Fault>> + Send,
{
    async fn handle(
        &self,
        user_id: &str,
        request_id: &str,
        user: &User,
        contents: Contents,
    ) -> Result<Contents, Fault> {
        (self.0)(HandlerRequest {
            user_id: user_id.to_string(),
            request_id: request_id.to_string(),
            user: user.clone(),
            contents,
        })
        .await
    }
}
