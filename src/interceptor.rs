//! Message interceptor pipeline.
//!
//! Interceptors observe (and on the send side, mutate) messages as they
//! move through the framework. All six hooks default to no-ops, so an
//! implementation only overrides what it needs.
//!
//! The [`InterceptorStack`] invokes "pre" hooks in registration order and
//! "post" hooks in reverse order. A failing pre-hook aborts the operation;
//! failing post-hooks are logged and swallowed.

use std::sync::Arc;

use crate::message::Message;

/// Hook points around sending, receiving and handling a message.
///
/// Hooks run synchronously on the hot path and should avoid heavy or
/// blocking work (same contract as the producer hooks they generalize).
pub trait MessageInterceptor: Send + Sync {
    /// Before the outbox row is written. May mutate headers.
    fn pre_send(&self, _message: &mut Message) -> Result<(), tower::BoxError> {
        Ok(())
    }

    /// After the outbox row is written.
    fn post_send(&self, _message: &Message) -> Result<(), tower::BoxError> {
        Ok(())
    }

    /// When a record has been fetched and decoded, before any dispatch.
    fn pre_receive(&self, _message: &Message) -> Result<(), tower::BoxError> {
        Ok(())
    }

    /// After dispatch finished, successfully or not.
    fn post_receive(&self, _message: &Message) -> Result<(), tower::BoxError> {
        Ok(())
    }

    /// Just before the handler body runs (duplicates never get this far).
    fn pre_handle(&self, _message: &Message) -> Result<(), tower::BoxError> {
        Ok(())
    }

    /// After the handler body returned.
    fn post_handle(&self, _message: &Message) -> Result<(), tower::BoxError> {
        Ok(())
    }
}

/// Ordered set of interceptors shared by producers and consumers.
#[derive(Clone, Default)]
pub struct InterceptorStack {
    interceptors: Arc<Vec<Arc<dyn MessageInterceptor>>>,
}

impl InterceptorStack {
    pub fn new(interceptors: Vec<Arc<dyn MessageInterceptor>>) -> Self {
        Self {
            interceptors: Arc::new(interceptors),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn pre_send(&self, message: &mut Message) -> Result<(), tower::BoxError> {
        for interceptor in self.interceptors.iter() {
            interceptor.pre_send(message)?;
        }
        Ok(())
    }

    pub fn post_send(&self, message: &Message) {
        for interceptor in self.interceptors.iter().rev() {
            if let Err(error) = interceptor.post_send(message) {
                tracing::error!(error = %error, "post_send interceptor failed");
            }
        }
    }

    pub fn pre_receive(&self, message: &Message) -> Result<(), tower::BoxError> {
        for interceptor in self.interceptors.iter() {
            interceptor.pre_receive(message)?;
        }
        Ok(())
    }

    pub fn post_receive(&self, message: &Message) {
        for interceptor in self.interceptors.iter().rev() {
            if let Err(error) = interceptor.post_receive(message) {
                tracing::error!(error = %error, "post_receive interceptor failed");
            }
        }
    }

    pub fn pre_handle(&self, message: &Message) -> Result<(), tower::BoxError> {
        for interceptor in self.interceptors.iter() {
            interceptor.pre_handle(message)?;
        }
        Ok(())
    }

    pub fn post_handle(&self, message: &Message) {
        for interceptor in self.interceptors.iter().rev() {
            if let Err(error) = interceptor.post_handle(message) {
                tracing::error!(error = %error, "post_handle interceptor failed");
            }
        }
    }
}
