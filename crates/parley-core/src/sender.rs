use crate::error::CoreError;
use crate::fanout::{EncodeOutcome, FanoutEncoder};
use crate::ids::{DeviceId, UserId};
use crate::outbox::{Outbox, OutboxItem};
use crate::policy::Policy;
use crate::prekeys::RecipientMap;
use crate::reconcile::reconcile;
use crate::time::now_ms;
use crate::transport::{MessageApi, SendAttempt};
use parley_api::types::{ConversationId, ValidationLimits};
use parley_api::validation::validate_send_request;
use std::sync::Arc;

/// Per-device breakdown of one logical send, handed back to the caller.
#[derive(Clone, Debug, Default)]
pub struct SendSummary {
    pub delivered: Vec<(UserId, DeviceId)>,
    pub skipped: Vec<(UserId, DeviceId)>,
    pub failed: Vec<(UserId, DeviceId)>,
}

pub struct MessageSender {
    encoder: FanoutEncoder,
    api: Arc<dyn MessageApi>,
    outbox: Outbox,
    policy: Policy,
    limits: ValidationLimits,
}

impl MessageSender {
    pub fn new(
        encoder: FanoutEncoder,
        api: Arc<dyn MessageApi>,
        outbox: Outbox,
        policy: Policy,
    ) -> Self {
        Self {
            encoder,
            api,
            outbox,
            policy,
            limits: ValidationLimits::default(),
        }
    }

    /// One logical send: encode, queue durably, submit, and reconcile a
    /// stale recipient set at most once before giving up with
    /// `RecipientsUnstable`.
    pub async fn send(
        &self,
        conversation: &ConversationId,
        plaintext: &[u8],
        recipients: &RecipientMap,
    ) -> Result<SendSummary, CoreError> {
        let outcome = self.encoder.encode(plaintext, recipients).await?;
        if outcome.message.recipients.is_empty() {
            // Nothing reachable; not a failure, the caller sees who was skipped.
            return Ok(summary_from(&outcome));
        }
        validate_send_request(&outcome.message, &self.limits)
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        let item = OutboxItem::new(conversation.clone(), outcome.message.clone());
        self.outbox.put(&item).await?;
        match self.api.post_message(conversation, &item.message).await {
            Ok(SendAttempt::Sent) => {
                self.outbox.mark_sent(&item.id).await?;
                Ok(summary_from(&outcome))
            }
            Ok(SendAttempt::Mismatch(diff)) => {
                log::warn!(
                    "stale recipients for {}: {} missing, {} redundant, {} deleted",
                    conversation.value,
                    diff.missing.len(),
                    diff.redundant.len(),
                    diff.deleted.len()
                );
                // Original payloads are discarded with the item; a corrected
                // envelope is built fresh.
                self.outbox.mark_sent(&item.id).await?;
                let corrected = reconcile(&diff, recipients);
                self.retry_with(conversation, plaintext, &corrected, &outcome)
                    .await
            }
            Err(err) => {
                self.outbox.bump_retry(&item.id, &self.policy).await?;
                Err(err)
            }
        }
    }

    async fn retry_with(
        &self,
        conversation: &ConversationId,
        plaintext: &[u8],
        corrected: &RecipientMap,
        first: &EncodeOutcome,
    ) -> Result<SendSummary, CoreError> {
        let outcome = self.encoder.encode(plaintext, corrected).await?;
        let mut summary = summary_from(&outcome);
        merge_unreachable(&mut summary, first);
        if outcome.message.recipients.is_empty() {
            return Ok(summary);
        }
        let item = OutboxItem::new(conversation.clone(), outcome.message.clone());
        self.outbox.put(&item).await?;
        match self.api.post_message(conversation, &item.message).await {
            Ok(SendAttempt::Sent) => {
                self.outbox.mark_sent(&item.id).await?;
                Ok(summary)
            }
            Ok(SendAttempt::Mismatch(_)) => {
                // Twice stale for one logical send; stop looping. The item
                // stays queued for a later resubmission.
                self.outbox.bump_retry(&item.id, &self.policy).await?;
                Err(CoreError::RecipientsUnstable)
            }
            Err(err) => {
                self.outbox.bump_retry(&item.id, &self.policy).await?;
                Err(err)
            }
        }
    }

    /// Resubmits due queued envelopes byte-identical. Stale-recipient
    /// rejections here cannot be reconciled (the plaintext is gone), so the
    /// item just waits for its retry window to lapse.
    pub async fn flush_pending(&self) -> Result<usize, CoreError> {
        let now = now_ms();
        let window_ms = self.policy.max_retry_window_secs.saturating_mul(1000);
        let due = self
            .outbox
            .load_all_due(now, self.policy.outbox_batch_send)
            .await?;
        let mut sent = 0;
        for item in due {
            if now.saturating_sub(item.created_at_ms) > window_ms {
                log::warn!("dropping expired outbox item {}", item.id);
                self.outbox.mark_sent(&item.id).await?;
                continue;
            }
            match self.api.post_message(&item.conversation, &item.message).await {
                Ok(SendAttempt::Sent) => {
                    self.outbox.mark_sent(&item.id).await?;
                    sent += 1;
                }
                Ok(SendAttempt::Mismatch(_)) | Err(_) => {
                    self.outbox.bump_retry(&item.id, &self.policy).await?;
                }
            }
        }
        Ok(sent)
    }
}

fn summary_from(outcome: &EncodeOutcome) -> SendSummary {
    SendSummary {
        delivered: outcome.encrypted.clone(),
        skipped: outcome.skipped.clone(),
        failed: outcome.failed.clone(),
    }
}

fn merge_unreachable(summary: &mut SendSummary, first: &EncodeOutcome) {
    for pair in first.skipped.iter() {
        if !summary.skipped.contains(pair) {
            summary.skipped.push(pair.clone());
        }
    }
    for pair in first.failed.iter() {
        if !summary.failed.contains(pair) {
            summary.failed.push(pair.clone());
        }
    }
}
