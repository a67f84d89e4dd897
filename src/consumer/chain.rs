//! The decorator chain wrapped around every handler invocation.
//!
//! The chain is built once per subscription and reused for every message.
//! Dispatch walks an index over a shared decorator slice instead of
//! nesting closures, so invoking the chain costs a few `Arc` clones.
//!
//! Fixed order: receive interceptors → duplicate detection → handle
//! interceptors → terminal handler (which opens the service scope).
//! Each decorator invokes its continuation at most once.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::consumer::{HandlerFuture, MessageHandler};
use crate::inbox::{ExactlyOnce, ReceiveOutcome};
use crate::interceptor::InterceptorStack;
use crate::message::Message;
use crate::scope::ServiceRegistry;

/// One stage of the chain.
#[async_trait]
pub trait HandlerDecorator: Send + Sync {
    /// Process `message`, calling `next` at most once.
    async fn handle(&self, message: Message, next: Next) -> Result<(), tower::BoxError>;
}

/// Continuation of a chain dispatch: the remaining stages plus terminal.
pub struct Next {
    stages: Arc<[Arc<dyn HandlerDecorator>]>,
    index: usize,
    registry: Arc<ServiceRegistry>,
    terminal: Arc<dyn MessageHandler>,
    cancellation: CancellationToken,
}

impl Next {
    /// Run the rest of the chain.
    pub fn run(self, message: Message) -> HandlerFuture {
        let Next {
            stages,
            index,
            registry,
            terminal,
            cancellation,
        } = self;
        Box::pin(async move {
            match stages.get(index).cloned() {
                Some(stage) => {
                    let next = Next {
                        stages,
                        index: index + 1,
                        registry,
                        terminal,
                        cancellation,
                    };
                    stage.handle(message, next).await
                }
                None => {
                    let scope = registry.open_scope(cancellation);
                    terminal.handle(message, scope).await
                }
            }
        })
    }
}

/// A subscription's reusable chain.
#[derive(Clone)]
pub struct DecoratorChain {
    stages: Arc<[Arc<dyn HandlerDecorator>]>,
    registry: Arc<ServiceRegistry>,
    terminal: Arc<dyn MessageHandler>,
}

impl DecoratorChain {
    /// Build the standard chain for one subscriber.
    pub fn standard(
        subscriber_id: &str,
        interceptors: InterceptorStack,
        inbox: Arc<dyn ExactlyOnce>,
        registry: Arc<ServiceRegistry>,
        terminal: Arc<dyn MessageHandler>,
    ) -> Self {
        let stages: Vec<Arc<dyn HandlerDecorator>> = vec![
            Arc::new(ReceiveInterceptors {
                stack: interceptors.clone(),
            }),
            Arc::new(DuplicateDetection {
                inbox,
                subscriber_id: subscriber_id.to_owned(),
            }),
            Arc::new(HandleInterceptors {
                stack: interceptors,
            }),
        ];
        Self {
            stages: stages.into(),
            registry,
            terminal,
        }
    }

    /// Dispatch one message through the chain.
    ///
    /// `cancellation` is the swimlane token; it ends up in the handler's
    /// service scope.
    pub async fn dispatch(
        &self,
        message: Message,
        cancellation: CancellationToken,
    ) -> Result<(), tower::BoxError> {
        Next {
            stages: Arc::clone(&self.stages),
            index: 0,
            registry: Arc::clone(&self.registry),
            terminal: Arc::clone(&self.terminal),
            cancellation,
        }
        .run(message)
        .await
    }
}

/// Stage 1: `pre_receive` / `post_receive` hooks around everything else.
struct ReceiveInterceptors {
    stack: InterceptorStack,
}

#[async_trait]
impl HandlerDecorator for ReceiveInterceptors {
    async fn handle(&self, message: Message, next: Next) -> Result<(), tower::BoxError> {
        self.stack.pre_receive(&message)?;
        let observed = message.clone();
        let result = next.run(message).await;
        self.stack.post_receive(&observed);
        result
    }
}

/// Stage 2: the inbox gate.
struct DuplicateDetection {
    inbox: Arc<dyn ExactlyOnce>,
    subscriber_id: String,
}

#[async_trait]
impl HandlerDecorator for DuplicateDetection {
    async fn handle(&self, message: Message, next: Next) -> Result<(), tower::BoxError> {
        let message_id = message.id.clone();
        let outcome = self
            .inbox
            .process_exactly_once(
                &message_id,
                &self.subscriber_id,
                Box::new(move || next.run(message)),
            )
            .await?;
        if outcome == ReceiveOutcome::Duplicate {
            tracing::debug!(message_id = %message_id, "duplicate message skipped");
        }
        Ok(())
    }
}

/// Stage 3: `pre_handle` / `post_handle` hooks around the handler body.
struct HandleInterceptors {
    stack: InterceptorStack,
}

#[async_trait]
impl HandlerDecorator for HandleInterceptors {
    async fn handle(&self, message: Message, next: Next) -> Result<(), tower::BoxError> {
        self.stack.pre_handle(&message)?;
        let observed = message.clone();
        let result = next.run(message).await;
        self.stack.post_handle(&observed);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::inbox::inmemory::InMemoryInbox;
    use crate::interceptor::MessageInterceptor;
    use crate::scope::ServiceScope;

    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl MessageInterceptor for Recorder {
        fn pre_receive(&self, _m: &Message) -> Result<(), tower::BoxError> {
            self.0.lock().unwrap().push("pre_receive");
            Ok(())
        }
        fn post_receive(&self, _m: &Message) -> Result<(), tower::BoxError> {
            self.0.lock().unwrap().push("post_receive");
            Ok(())
        }
        fn pre_handle(&self, _m: &Message) -> Result<(), tower::BoxError> {
            self.0.lock().unwrap().push("pre_handle");
            Ok(())
        }
        fn post_handle(&self, _m: &Message) -> Result<(), tower::BoxError> {
            self.0.lock().unwrap().push("post_handle");
            Ok(())
        }
    }

    struct Terminal {
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl MessageHandler for Terminal {
        fn handle(&self, _message: Message, _scope: ServiceScope) -> HandlerFuture {
            self.calls.lock().unwrap().push("handler");
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err("handler failed".into())
                } else {
                    Ok(())
                }
            })
        }
    }

    fn chain(
        calls: &Arc<Mutex<Vec<&'static str>>>,
        inbox: &InMemoryInbox,
        fail: bool,
    ) -> DecoratorChain {
        DecoratorChain::standard(
            "sub",
            InterceptorStack::new(vec![Arc::new(Recorder(Arc::clone(calls)))]),
            Arc::new(inbox.clone()),
            Arc::new(ServiceRegistry::new()),
            Arc::new(Terminal {
                calls: Arc::clone(calls),
                fail,
            }),
        )
    }

    fn message(id: &str) -> Message {
        let mut m = Message::build("{}").finish();
        m.id = id.to_owned();
        m
    }

    #[tokio::test]
    async fn stages_run_in_the_documented_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let inbox = InMemoryInbox::new();
        let chain = chain(&calls, &inbox, false);

        chain
            .dispatch(message("m1"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "pre_receive",
                "pre_handle",
                "handler",
                "post_handle",
                "post_receive"
            ]
        );
        assert!(inbox.contains("m1", "sub").await);
    }

    #[tokio::test]
    async fn duplicates_skip_handling_but_still_ack() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let inbox = InMemoryInbox::new();
        let chain = chain(&calls, &inbox, false);

        chain
            .dispatch(message("m1"), CancellationToken::new())
            .await
            .unwrap();
        calls.lock().unwrap().clear();

        chain
            .dispatch(message("m1"), CancellationToken::new())
            .await
            .unwrap();

        // the handle hooks and the handler sit behind the gate
        assert_eq!(*calls.lock().unwrap(), vec!["pre_receive", "post_receive"]);
        assert_eq!(inbox.len().await, 1);
    }

    #[tokio::test]
    async fn handler_failure_rolls_back_the_claim() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let inbox = InMemoryInbox::new();
        let chain = chain(&calls, &inbox, true);

        let result = chain.dispatch(message("m1"), CancellationToken::new()).await;

        assert!(result.is_err());
        assert!(inbox.is_empty().await);
    }
}
