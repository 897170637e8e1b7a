//! Vendor data sources
//!
//! A [`DataSource`] is the only thing a coordinator knows about the vendor:
//! it can fetch one complete snapshot, and optionally prepare itself once
//! before the first fetch (log in, discover devices).

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::error::UpdateError;

#[async_trait]
pub trait DataSource<T>: Send + Sync {
    /// Fetch one complete snapshot
    ///
    /// Must only read vendor state; it is called repeatedly.
    async fn fetch(&self) -> Result<T, UpdateError>;

    /// One-time preparation before the first fetch
    ///
    /// Retried on the next cycle until it succeeds.
    async fn setup(&self) -> Result<(), UpdateError> {
        Ok(())
    }
}

/// Adapts a closure returning a future into a [`DataSource`]
pub struct FnSource<F, T> {
    fetch: F,
    _data: PhantomData<fn() -> T>,
}

impl<F, T> FnSource<F, T> {
    pub fn new(fetch: F) -> Self {
        Self {
            fetch,
            _data: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, T> DataSource<T> for FnSource<F, T>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, UpdateError>> + Send,
    T: Send,
{
    async fn fetch(&self) -> Result<T, UpdateError> {
        (self.fetch)().await
    }
}
