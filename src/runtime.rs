//! Async front-end for tokio services.
//!
//! Compute functions are synchronous and may run for minutes, so requests
//! are moved onto tokio's blocking pool rather than run on a worker thread.

use std::sync::Arc;

use crate::engine::CancelToken;
use crate::resolver::Request;
use crate::schema::Entity;
use crate::{Error, Pipeline, Result};

impl Pipeline {
    /// Run [`Pipeline::request`] on the blocking pool.
    ///
    /// # Errors
    ///
    /// As [`Pipeline::request`]; `Cancelled` if the runtime shut down
    /// before the task ran.
    pub async fn request_async(self: &Arc<Self>, request: Request) -> Result<Entity> {
        let pipeline = Arc::clone(self);
        let target = request.target().to_string();
        join(target, tokio::task::spawn_blocking(move || pipeline.request(&request))).await
    }

    /// Run [`Pipeline::request_with_cancel`] on the blocking pool. Cancelling
    /// the token stops the request before its next step starts.
    ///
    /// # Errors
    ///
    /// As [`Pipeline::request_with_cancel`].
    pub async fn request_async_with_cancel(
        self: &Arc<Self>,
        request: Request,
        cancel: CancelToken,
    ) -> Result<Entity> {
        let pipeline = Arc::clone(self);
        let target = request.target().to_string();
        join(
            target,
            tokio::task::spawn_blocking(move || pipeline.request_with_cancel(&request, &cancel)),
        )
        .await
    }
}

async fn join(target: String, handle: tokio::task::JoinHandle<Result<Entity>>) -> Result<Entity> {
    match handle.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(_) => Err(Error::Cancelled { node: target }),
    }
}
