//! Forgotten-customer recovery scan
//!
//! Walks an instance's stalled conversations once, scores each one, asks
//! the reply generator for an opener, and persists what it finds. Results
//! stream out as events so the UI fills in while the scan runs.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::ai::{ReplyContext, ReplyGenerator};
use crate::config::RecoveryConfig;
use crate::db::{Conversation, ConversationRepo, Direction, ForgottenRepo, NewForgotten};
use crate::events::{
    build_recovery_finished_event, build_recovery_found_event, build_recovery_progress_event,
    build_recovery_started_event, SharedSink,
};
use crate::scoring::{estimate_value_cents, score_conversation, ScoreInput};
use crate::Result;

/// Outcome of one scan run
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ScanSummary {
    pub scanned: u32,
    pub found: u32,
    pub total_value_cents: i64,
    /// The instance was already scanned and this run did nothing
    pub skipped: bool,
}

/// Recovery scanner over one tenant's data
pub struct RecoveryScanner {
    conversations: ConversationRepo,
    forgotten: ForgottenRepo,
    replies: Arc<dyn ReplyGenerator>,
    events: SharedSink,
    config: RecoveryConfig,
}

impl RecoveryScanner {
    #[must_use]
    pub fn new(
        conversations: ConversationRepo,
        forgotten: ForgottenRepo,
        replies: Arc<dyn ReplyGenerator>,
        events: SharedSink,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            conversations,
            forgotten,
            replies,
            events,
            config,
        }
    }

    /// Run the scan for one instance. Unless `force` is set, an instance
    /// that already has surfaced customers is skipped, which makes the
    /// on-connect trigger idempotent across reconnects.
    ///
    /// # Errors
    ///
    /// Returns error if the conversation walk or a persist fails; a failed
    /// reply generation only degrades that record
    pub async fn run(&self, tenant_id: &str, instance_id: &str, force: bool) -> Result<ScanSummary> {
        if !force && self.forgotten.has_any_for_instance(tenant_id, instance_id)? {
            tracing::info!(tenant_id, instance_id, "instance already scanned, skipping");
            return Ok(ScanSummary {
                skipped: true,
                ..ScanSummary::default()
            });
        }

        let stale = self.conversations.stale_conversations(
            tenant_id,
            instance_id,
            self.config.min_silence_hours,
        )?;
        let total = u32::try_from(stale.len()).unwrap_or(u32::MAX);

        tracing::info!(tenant_id, instance_id, total, "recovery scan started");
        self.events
            .emit(build_recovery_started_event(tenant_id, instance_id, total));

        let started = Instant::now();
        let mut summary = ScanSummary::default();

        for (i, conv) in stale.iter().enumerate() {
            summary.scanned += 1;
            if let Some((temperature, value)) = self.process_conversation(conv).await? {
                summary.found += 1;
                summary.total_value_cents += value;
                self.events.emit(build_recovery_found_event(
                    tenant_id,
                    instance_id,
                    &conv.contact_phone,
                    temperature,
                    value,
                ));
            }

            let current = u32::try_from(i + 1).unwrap_or(u32::MAX);
            let percentage =
                u32::try_from(u64::from(current) * 100 / u64::from(total.max(1))).unwrap_or(100);
            let per_item = started.elapsed().as_secs_f64() / f64::from(current);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let eta_seconds = (per_item * f64::from(total - current)) as u64;
            self.events.emit(build_recovery_progress_event(
                tenant_id,
                instance_id,
                current,
                total,
                percentage,
                eta_seconds,
            ));
        }

        tracing::info!(
            tenant_id,
            instance_id,
            scanned = summary.scanned,
            found = summary.found,
            total_value_cents = summary.total_value_cents,
            "recovery scan finished"
        );
        self.events.emit(build_recovery_finished_event(
            tenant_id,
            instance_id,
            summary.scanned,
            summary.found,
            summary.total_value_cents,
        ));

        Ok(summary)
    }

    /// Score one conversation; `None` means it was skipped or already
    /// surfaced
    async fn process_conversation(&self, conv: &Conversation) -> Result<Option<(u8, i64)>> {
        let hours_of_silence = (Utc::now() - conv.last_message_at).num_hours();
        if hours_of_silence > self.config.max_silence_hours {
            return Ok(None);
        }

        let messages = self.conversations.recent_messages(&conv.id, 10)?;
        let Some(last) = messages.last() else {
            return Ok(None);
        };

        let prior_value = self
            .forgotten
            .best_converted_value(&conv.tenant_id, &conv.contact_phone)?;
        let temperature = score_conversation(&ScoreInput {
            last_message: &last.body,
            last_direction: conv.last_direction,
            hours_of_silence,
            prior_purchase: prior_value.is_some(),
            above_average_value: prior_value
                .is_some_and(|v| v > self.config.default_avg_ticket_cents),
        });
        let value = estimate_value_cents(self.config.default_avg_ticket_cents, temperature.score);

        let reply = match self
            .replies
            .suggest_reply(&ReplyContext {
                contact_name: conv.contact_name.as_deref(),
                recent_messages: &messages,
                temperature: &temperature,
                hours_of_silence,
            })
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conv.id,
                    error = %e,
                    "reply generation failed, persisting without suggestion"
                );
                crate::ai::SuggestedReply {
                    text: String::new(),
                    rationale: String::new(),
                }
            }
        };

        // Customer spoke last means the business went silent
        let silent_side = match conv.last_direction {
            Direction::Inbound => "business",
            Direction::Outbound => "customer",
        };

        let inserted = self.forgotten.insert(&NewForgotten {
            tenant_id: &conv.tenant_id,
            instance_id: &conv.instance_id,
            contact_phone: &conv.contact_phone,
            contact_name: conv.contact_name.as_deref(),
            silent_side,
            last_message: &last.body,
            last_message_at: conv.last_message_at,
            hours_of_silence,
            temperature: &temperature,
            estimated_value_cents: value,
            suggested_reply: &reply.text,
            reply_rationale: &reply.rationale,
        })?;

        Ok(inserted.map(|_| (temperature.score, value)))
    }
}
