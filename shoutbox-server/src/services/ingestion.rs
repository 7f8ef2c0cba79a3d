use shared::models::{Message, MessageId};
use tracing::{info, instrument};

use super::{
    error::{ShoutboxError, ShoutboxResult},
    fanout::{PublishKind, SharedFanout},
    store::{EditOutcome, SharedMessageStore},
};

/// Validates, persists, then publishes submissions and edits.
///
/// Publishing happens only after the store accepted the write, and a publish
/// never undoes a write. Clients that miss a publish recover the message from
/// history.
#[derive(Clone)]
pub struct IngestionPipeline {
    store: SharedMessageStore,
    fanout: SharedFanout,
    max_body_chars: usize,
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("max_body_chars", &self.max_body_chars)
            .finish_non_exhaustive()
    }
}

impl IngestionPipeline {
    /// Creates a pipeline over `store` publishing to `fanout`.
    #[must_use]
    pub fn new(store: SharedMessageStore, fanout: SharedFanout, max_body_chars: usize) -> Self {
        Self {
            store,
            fanout,
            max_body_chars,
        }
    }

    /// The store backing this pipeline.
    #[must_use]
    pub fn store(&self) -> &SharedMessageStore {
        &self.store
    }

    /// Rejects blank bodies and bodies longer than the configured maximum,
    /// counted in Unicode scalar values.
    ///
    /// # Errors
    /// Returns [`ShoutboxError::Validation`] describing the violation.
    pub fn validate_body(&self, body: &str) -> ShoutboxResult<()> {
        if body.trim().is_empty() {
            return Err(ShoutboxError::Validation(
                "message body must not be empty".into(),
            ));
        }
        let length = body.chars().count();
        if length > self.max_body_chars {
            return Err(ShoutboxError::Validation(format!(
                "message body is {length} characters; the limit is {}",
                self.max_body_chars
            )));
        }
        Ok(())
    }

    /// Accepts a new message from `author`.
    ///
    /// # Errors
    /// `Validation` for a bad body, `TransientIo` when the store fails.
    #[instrument(name = "ingest.submit", skip(self, body), err)]
    pub async fn submit(&self, author: &str, body: &str) -> ShoutboxResult<Message> {
        self.validate_body(body).inspect_err(|err| reject(err))?;

        let message = self
            .store
            .insert(author, body)
            .await
            .map_err(ShoutboxError::from)
            .inspect_err(|err| reject(err))?;

        let sequence = self
            .fanout
            .publish(PublishKind::Created, message.clone())
            .await;
        metrics::counter!("shoutbox_messages_accepted_total", "kind" => "created").increment(1);
        info!(id = message.id, sequence, "message accepted");
        Ok(message)
    }

    /// Replaces the body of `message_id` when `author` wrote it.
    ///
    /// # Errors
    /// `Validation` for a bad body, `NotFound` for a missing or removed
    /// message, `Authorization` when `author` did not write it, `TransientIo`
    /// when the store fails.
    #[instrument(name = "ingest.submit_edit", skip(self, body), err)]
    pub async fn submit_edit(
        &self,
        author: &str,
        message_id: MessageId,
        body: &str,
    ) -> ShoutboxResult<Message> {
        self.validate_body(body).inspect_err(|err| reject(err))?;

        let outcome = self
            .store
            .update_body(message_id, author, body)
            .await
            .map_err(ShoutboxError::from)
            .inspect_err(|err| reject(err))?;

        let message = match outcome {
            EditOutcome::Updated(message) => message,
            EditOutcome::NotFound => {
                let err = ShoutboxError::NotFound(format!("message {message_id} not found"));
                reject(&err);
                return Err(err);
            }
            EditOutcome::NotAuthor => {
                let err = ShoutboxError::Authorization(format!(
                    "only the author may edit message {message_id}"
                ));
                reject(&err);
                return Err(err);
            }
        };

        let sequence = self
            .fanout
            .publish(PublishKind::Edited, message.clone())
            .await;
        metrics::counter!("shoutbox_messages_accepted_total", "kind" => "edited").increment(1);
        info!(
            id = message.id,
            revision = message.revision,
            sequence,
            "edit accepted"
        );
        Ok(message)
    }
}

pub(super) fn reject(err: &ShoutboxError) {
    metrics::counter!("shoutbox_messages_rejected_total", "code" => err.code().as_str())
        .increment(1);
}
