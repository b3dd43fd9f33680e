//! Stage policies: validation, precondition and execution.
//!
//! Each stage is a single-method trait. Closures implement them directly:
//!
//! - `Fn(&R) -> Result<(), Rejection>` is a [`Validator`] and a [`PreconditionChecker`]
//! - `Fn(R) -> impl Future<Output = anyhow::Result<T>>` is an [`Executor`]
//!
//! Precondition checks that need I/O implement [`PreconditionChecker`] on a type.

use std::future::Future;

use crate::domain::Rejection;

/// Checks request shape. Stateless and side-effect free.
pub trait Validator<R>: Send + Sync {
    fn validate(&self, request: &R) -> Result<(), Rejection>;
}

impl<R, F> Validator<R> for F
where
    F: Fn(&R) -> Result<(), Rejection> + Send + Sync,
{
    fn validate(&self, request: &R) -> Result<(), Rejection> {
        self(request)
    }
}

/// Checks business state before execution. May read, must not mutate.
pub trait PreconditionChecker<R>: Send + Sync {
    fn check(&self, request: &R) -> impl Future<Output = Result<(), Rejection>> + Send;
}

impl<R, F> PreconditionChecker<R> for F
where
    F: Fn(&R) -> Result<(), Rejection> + Send + Sync,
{
    fn check(&self, request: &R) -> impl Future<Output = Result<(), Rejection>> + Send {
        std::future::ready(self(request))
    }
}

/// Performs the operation's side effects
pub trait Executor<R, T>: Send + Sync {
    fn execute(&self, request: R) -> impl Future<Output = anyhow::Result<T>> + Send;
}

impl<R, T, F, Fut> Executor<R, T> for F
where
    F: Fn(R) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send,
{
    fn execute(&self, request: R) -> impl Future<Output = anyhow::Result<T>> + Send {
        self(request)
    }
}

/// Policy that accepts every request
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl<R> Validator<R> for AcceptAll {
    fn validate(&self, _request: &R) -> Result<(), Rejection> {
        Ok(())
    }
}

impl<R> PreconditionChecker<R> for AcceptAll {
    fn check(&self, _request: &R) -> impl Future<Output = Result<(), Rejection>> + Send {
        std::future::ready(Ok(()))
    }
}
