//! Outbox producer: the send half of the framework.
//!
//! [`MessageProducer::send`] turns a [`Message`] into an outbox row inside
//! the caller's database transaction. Delivery is someone else's job (the
//! CDC relay); the producer's contract is purely transactional: either
//! the business write and the row both commit, or neither does.

use chrono::Utc;
use tracing_error::SpanTrace;

use crate::ids::MessageIdGenerator;
use crate::interceptor::InterceptorStack;
use crate::message::{Message, MessageError, headers};
use crate::outbox::{InsertRecord, OutboxRecord};

/// Sends messages by writing them to an outbox store.
///
/// Generic over the store driver `D`, mirroring the backend split of the
/// outbox module (in-memory for tests, Postgres in production).
pub struct MessageProducer<D> {
    outbox: D,
    ids: MessageIdGenerator,
    interceptors: InterceptorStack,
}

impl<D> MessageProducer<D>
where
    D: InsertRecord + Send + Sync,
    D::Error: Into<tower::BoxError>,
{
    pub fn new(outbox: D) -> Self {
        Self {
            outbox,
            ids: MessageIdGenerator::new(),
            interceptors: InterceptorStack::default(),
        }
    }

    /// Attach an interceptor stack invoked around every send.
    pub fn with_interceptors(mut self, interceptors: InterceptorStack) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Write `message` to the outbox, addressed to `destination`, inside
    /// the caller's transaction.
    ///
    /// Stamps the reserved `ID`, `DESTINATION` and `DATE` headers, runs
    /// the pre-send interceptors (which may rewrite headers, including
    /// the destination), persists the row with `published = 0` and runs
    /// the post-send interceptors. Returns the assigned message id.
    ///
    /// Any failure propagates to the caller; rolling back is the caller's
    /// decision, retrying is the relay's.
    #[tracing::instrument(skip(self, message, tx))]
    pub async fn send(
        &self,
        destination: &str,
        mut message: Message,
        tx: &mut D::Transaction<'_>,
    ) -> Result<String, SendError> {
        if destination.is_empty() {
            return Err(SendError::invalid_destination());
        }

        let id = self.ids.generate();
        message.id = id.clone();
        message.set_header(headers::ID, id.clone());
        message.set_header(headers::DESTINATION, destination);
        message.set_header(headers::DATE, Utc::now().to_rfc3339());

        self.interceptors
            .pre_send(&mut message)
            .map_err(SendError::interceptor)?;

        // interceptors may have rerouted the message
        let destination = message
            .required_header(headers::DESTINATION)
            .map_err(SendError::envelope)?
            .to_owned();
        let header_json =
            serde_json::to_string(&message.headers).map_err(SendError::codec)?;

        let record = OutboxRecord::new(&id, destination, header_json, &message.payload);
        self.outbox
            .insert_record(record, tx)
            .await
            .map_err(|e| SendError::store(e.into()))?;

        self.interceptors.post_send(&message);

        Ok(id)
    }
}

/// Error returned by [`MessageProducer::send`].
#[derive(Debug)]
pub struct SendError {
    context: SpanTrace,
    kind: SendErrorKind,
}

/// Classification of send failures.
#[derive(Debug)]
pub enum SendErrorKind {
    /// The destination was empty or went missing after interception.
    InvalidDestination,
    /// Envelope accessor failure.
    Envelope(MessageError),
    /// Header or payload serialization failed; nothing was persisted.
    Codec(serde_json::Error),
    /// A pre-send interceptor aborted the operation.
    Interceptor(tower::BoxError),
    /// The outbox insert failed; the caller's transaction should roll back.
    Store(tower::BoxError),
}

impl SendError {
    fn invalid_destination() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SendErrorKind::InvalidDestination,
        }
    }

    fn envelope(err: MessageError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SendErrorKind::Envelope(err),
        }
    }

    pub(crate) fn codec(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SendErrorKind::Codec(err),
        }
    }

    fn interceptor(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SendErrorKind::Interceptor(err),
        }
    }

    fn store(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SendErrorKind::Store(err),
        }
    }

    pub fn kind(&self) -> &SendErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SendErrorKind::InvalidDestination => writeln!(f, "Destination must be non-empty"),
            SendErrorKind::Envelope(err) => writeln!(f, "Envelope error: {err}"),
            SendErrorKind::Codec(err) => writeln!(f, "Codec error: {err}"),
            SendErrorKind::Interceptor(err) => writeln!(f, "Interceptor rejected send: {err}"),
            SendErrorKind::Store(err) => writeln!(f, "Outbox error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SendErrorKind::InvalidDestination => None,
            SendErrorKind::Envelope(err) => Some(err),
            SendErrorKind::Codec(err) => Some(err),
            SendErrorKind::Interceptor(err) => Some(err.as_ref()),
            SendErrorKind::Store(err) => Some(err.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::interceptor::MessageInterceptor;
    use crate::outbox::inmemory::InMemoryOutbox;

    #[tokio::test]
    async fn send_stamps_reserved_headers_and_persists() {
        let outbox = InMemoryOutbox::new();
        let producer = MessageProducer::new(outbox.clone());

        let mut tx = ();
        let id = producer
            .send("orders", Message::build(r#"{"n":1}"#).finish(), &mut tx)
            .await
            .unwrap();

        let rows = outbox.records().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].destination, "orders");
        assert_eq!(rows[0].published, 0);

        let stored: BTreeMap<String, String> =
            serde_json::from_str(&rows[0].headers).unwrap();
        assert_eq!(stored.get("ID"), Some(&id));
        assert_eq!(stored["DESTINATION"], "orders");
        assert!(stored.contains_key("DATE"));
    }

    #[tokio::test]
    async fn empty_destination_is_rejected() {
        let producer = MessageProducer::new(InMemoryOutbox::new());
        let mut tx = ();
        let err = producer
            .send("", Message::build("p").finish(), &mut tx)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), SendErrorKind::InvalidDestination));
    }

    struct Reroute;

    impl MessageInterceptor for Reroute {
        fn pre_send(&self, message: &mut Message) -> Result<(), tower::BoxError> {
            message.set_header(headers::DESTINATION, "rerouted");
            Ok(())
        }
    }

    #[tokio::test]
    async fn pre_send_interceptor_can_reroute() {
        let outbox = InMemoryOutbox::new();
        let producer = MessageProducer::new(outbox.clone())
            .with_interceptors(InterceptorStack::new(vec![Arc::new(Reroute)]));

        let mut tx = ();
        producer
            .send("orders", Message::build("p").finish(), &mut tx)
            .await
            .unwrap();

        assert_eq!(outbox.records().await[0].destination, "rerouted");
    }

    struct Veto(AtomicUsize);

    impl MessageInterceptor for Veto {
        fn pre_send(&self, _message: &mut Message) -> Result<(), tower::BoxError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err("not today".into())
        }
    }

    #[tokio::test]
    async fn vetoed_send_persists_nothing() {
        let outbox = InMemoryOutbox::new();
        let producer = MessageProducer::new(outbox.clone())
            .with_interceptors(InterceptorStack::new(vec![Arc::new(Veto(AtomicUsize::new(0)))]));

        let mut tx = ();
        let err = producer
            .send("orders", Message::build("p").finish(), &mut tx)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), SendErrorKind::Interceptor(_)));
        assert!(outbox.records().await.is_empty());
    }
}
