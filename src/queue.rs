//! Update queue
//!
//! Append-only log of relay traffic partitioned by target audience. Rows are
//! marked processed when the relay hands them to a consumer, and acknowledged
//! when the consumer confirms it applied them. Delivery is at-least-once.

use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::model::{AppType, Update, UpdateType};
use crate::storage::db::{new_id, now};
use crate::storage::{Database, UpdateRecord};

/// Decode failures tolerated before a row is dead-lettered.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const MAX_BATCH_SIZE: usize = 500;

pub struct UpdateQueue {
    db: Arc<Database>,
}

impl UpdateQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append an update and return its id. The payload is stored as-is.
    pub fn enqueue(
        &self,
        update_type: UpdateType,
        source_type: AppType,
        target_type: AppType,
        content: serde_json::Value,
        priority: i64,
    ) -> Result<Update> {
        let update = Update {
            id: new_id(),
            update_type,
            source_type,
            target_type,
            content,
            priority,
            processed: false,
            processed_at: None,
            acknowledged: false,
            error_count: 0,
            last_error: None,
            created_at: now(),
        };
        self.append(&update)?;
        Ok(update)
    }

    /// Insert a fully formed update. A duplicate id is a constraint violation.
    pub fn append(&self, update: &Update) -> Result<()> {
        self.db.insert_update(update)?;
        tracing::debug!(
            id = %update.id,
            kind = %update.update_type,
            from = %update.source_type,
            to = %update.target_type,
            priority = update.priority,
            "enqueued update"
        );
        Ok(())
    }

    /// Unprocessed updates for `target`, most urgent first and oldest first
    /// within a priority band. Rows whose stored content no longer decodes are
    /// skipped and counted against their delivery budget.
    pub fn fetch_pending(&self, target: AppType, limit: usize) -> Result<Vec<Update>> {
        let limit = limit.clamp(1, MAX_BATCH_SIZE);
        let records = self.db.pending_updates(target, limit)?;
        let mut updates = Vec::with_capacity(records.len());
        for UpdateRecord {
            update,
            decode_error,
        } in records
        {
            match decode_error {
                None => updates.push(update),
                Some(error) => self.quarantine(&update.id, &error)?,
            }
        }
        Ok(updates)
    }

    /// Fetch pending updates and mark them processed in one step. This is the
    /// relay's consumption point. A consumer that fails between this call and
    /// applying the batch will not be offered these rows again.
    pub fn deliver(&self, target: AppType, limit: usize) -> Result<Vec<Update>> {
        let mut updates = self.fetch_pending(target, limit)?;
        if updates.is_empty() {
            return Ok(updates);
        }

        let at = now();
        let ids: Vec<String> = updates.iter().map(|u| u.id.clone()).collect();
        self.db.mark_updates_processed(&ids, at)?;
        for update in &mut updates {
            update.processed = true;
            update.processed_at = Some(at);
        }

        tracing::debug!(audience = %target, count = updates.len(), "delivered updates");
        Ok(updates)
    }

    /// Bulk-mark updates processed. Unknown and already processed ids are ignored.
    pub fn mark_processed(&self, ids: &[String]) -> Result<usize> {
        self.db.mark_updates_processed(ids, now())
    }

    /// Consumer confirmation. Unknown and already acknowledged ids are ignored.
    pub fn acknowledge(&self, ids: &[String]) -> Result<usize> {
        let acknowledged = self.db.acknowledge_updates(ids, now())?;
        if acknowledged < ids.len() {
            tracing::debug!(
                requested = ids.len(),
                acknowledged,
                "some acknowledgements were duplicates or unknown"
            );
        }
        Ok(acknowledged)
    }

    /// Processed but never acknowledged, for reconciliation and debugging.
    pub fn fetch_unacknowledged(&self, target: AppType) -> Result<Vec<Update>> {
        Ok(self
            .db
            .unacknowledged_updates(target)?
            .into_iter()
            .map(|record| record.update)
            .collect())
    }

    pub fn get(&self, id: &str) -> Result<Update> {
        self.db
            .get_update(id)?
            .map(|record| record.update)
            .ok_or_else(|| RelayError::not_found("update", id))
    }

    pub fn pending_count(&self, target: Option<AppType>) -> Result<u64> {
        self.db.count_pending_updates(target)
    }

    fn quarantine(&self, id: &str, error: &str) -> Result<()> {
        let attempts = self.db.record_update_failure(id, error)?;
        if attempts >= MAX_DELIVERY_ATTEMPTS {
            self.db
                .dead_letter_update(id, &format!("undeliverable: {error}"), now())?;
            tracing::warn!(id, attempts, error, "dead-lettered undecodable update");
        } else {
            tracing::warn!(id, attempts, error, "skipping undecodable update");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn queue() -> (Arc<Database>, UpdateQueue) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        (db.clone(), UpdateQueue::new(db))
    }

    fn push(queue: &UpdateQueue, label: &str, priority: i64) -> Update {
        queue
            .enqueue(
                UpdateType::Value,
                AppType::SourceApp,
                AppType::TargetApp,
                json!({ "label": label }),
                priority,
            )
            .unwrap()
    }

    #[test]
    fn priority_then_age_ordering() {
        let (_, queue) = queue();
        let a = push(&queue, "A", 0);
        let b = push(&queue, "B", 0);
        let c = push(&queue, "C", 1);

        let pending = queue.fetch_pending(AppType::TargetApp, 10).unwrap();
        let ids: Vec<_> = pending.iter().map(|u| u.id.clone()).collect();
        assert_eq!(ids, vec![c.id, a.id, b.id]);
    }

    #[test]
    fn audiences_are_partitioned() {
        let (_, queue) = queue();
        push(&queue, "A", 0);
        assert!(queue.fetch_pending(AppType::SourceApp, 10).unwrap().is_empty());
        assert_eq!(queue.pending_count(Some(AppType::TargetApp)).unwrap(), 1);
    }

    #[test]
    fn limit_bounds_the_batch() {
        let (_, queue) = queue();
        for i in 0..5 {
            push(&queue, &format!("u{i}"), 0);
        }
        assert_eq!(queue.fetch_pending(AppType::TargetApp, 2).unwrap().len(), 2);
    }

    #[test]
    fn deliver_marks_processed_once() {
        let (_, queue) = queue();
        let a = push(&queue, "A", 0);

        let delivered = queue.deliver(AppType::TargetApp, 10).unwrap();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].processed);
        let processed_at = queue.get(&a.id).unwrap().processed_at;

        assert!(queue.deliver(AppType::TargetApp, 10).unwrap().is_empty());
        // A second mark never rewrites the terminal row.
        assert_eq!(queue.mark_processed(&[a.id.clone()]).unwrap(), 0);
        assert_eq!(queue.get(&a.id).unwrap().processed_at, processed_at);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let (_, queue) = queue();
        assert_eq!(queue.mark_processed(&["ghost".to_string()]).unwrap(), 0);
        assert_eq!(queue.acknowledge(&["ghost".to_string()]).unwrap(), 0);
    }

    #[test]
    fn acknowledge_clears_unacknowledged() {
        let (_, queue) = queue();
        let a = push(&queue, "A", 0);
        queue.deliver(AppType::TargetApp, 10).unwrap();

        let waiting = queue.fetch_unacknowledged(AppType::TargetApp).unwrap();
        assert_eq!(waiting.len(), 1);

        assert_eq!(queue.acknowledge(&[a.id.clone(), a.id.clone()]).unwrap(), 1);
        assert!(queue.fetch_unacknowledged(AppType::TargetApp).unwrap().is_empty());
        assert!(queue.get(&a.id).unwrap().acknowledged);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let (_, queue) = queue();
        let a = push(&queue, "A", 0);
        let err = queue.append(&a).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    }

    #[test]
    fn undecodable_rows_are_dead_lettered() {
        let (db, queue) = queue();
        let good = push(&queue, "ok", 0);
        db.conn
            .lock()
            .execute(
                "INSERT INTO updates (id, type, source_type, target_type, content, created_at)
                 VALUES ('broken', 'value', 'source-app', 'target-app', '{not json', 0)",
                [],
            )
            .unwrap();

        for _ in 0..MAX_DELIVERY_ATTEMPTS {
            let pending = queue.fetch_pending(AppType::TargetApp, 10).unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].id, good.id);
        }

        let broken = queue.get("broken").unwrap();
        assert!(broken.processed);
        assert_eq!(broken.error_count, MAX_DELIVERY_ATTEMPTS);
        assert!(broken.last_error.unwrap().starts_with("undeliverable"));
    }
}
