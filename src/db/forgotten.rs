//! Forgotten-customer repository

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{parse_datetime, DbPool};
use crate::scoring::TemperatureResult;
use crate::{Error, Result};

/// Lifecycle of a surfaced forgotten customer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    Found,
    Replied,
    Converted,
    Ignored,
}

impl RecoveryStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::Replied => "replied",
            Self::Converted => "converted",
            Self::Ignored => "ignored",
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        match s {
            "replied" => Self::Replied,
            "converted" => Self::Converted,
            "ignored" => Self::Ignored,
            _ => Self::Found,
        }
    }
}

/// A customer surfaced by the recovery scan
#[derive(Debug, Clone)]
pub struct ForgottenCustomer {
    pub id: String,
    pub tenant_id: String,
    pub instance_id: String,
    pub contact_phone: String,
    pub contact_name: Option<String>,
    /// Which side of the conversation fell silent
    pub silent_side: String,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
    pub hours_of_silence: i64,
    pub temperature: u8,
    pub temperature_label: String,
    pub temperature_emoji: String,
    pub temperature_explanation: String,
    pub estimated_value_cents: i64,
    pub suggested_reply: String,
    pub reply_rationale: String,
    pub status: RecoveryStatus,
}

/// New forgotten-customer row, before it has an id
#[derive(Debug, Clone)]
pub struct NewForgotten<'a> {
    pub tenant_id: &'a str,
    pub instance_id: &'a str,
    pub contact_phone: &'a str,
    pub contact_name: Option<&'a str>,
    pub silent_side: &'a str,
    pub last_message: &'a str,
    pub last_message_at: DateTime<Utc>,
    pub hours_of_silence: i64,
    pub temperature: &'a TemperatureResult,
    pub estimated_value_cents: i64,
    pub suggested_reply: &'a str,
    pub reply_rationale: &'a str,
}

/// Forgotten-customer repository
#[derive(Clone)]
pub struct ForgottenRepo {
    pool: DbPool,
}

impl ForgottenRepo {
    /// Create a new forgotten-customer repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a surfaced customer. Returns `None` when the contact was
    /// already surfaced for this tenant (unique per tenant and phone).
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(&self, new: &NewForgotten<'_>) -> Result<Option<String>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO forgotten_customers (
                    id, tenant_id, instance_id, contact_phone, contact_name,
                    silent_side, last_message, last_message_at, hours_of_silence,
                    temperature, temperature_label, temperature_emoji, temperature_explanation,
                    estimated_value_cents, suggested_reply, reply_rationale
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                rusqlite::params![
                    id,
                    new.tenant_id,
                    new.instance_id,
                    new.contact_phone,
                    new.contact_name,
                    new.silent_side,
                    new.last_message,
                    new.last_message_at.to_rfc3339(),
                    new.hours_of_silence,
                    new.temperature.score,
                    new.temperature.label,
                    new.temperature.emoji,
                    new.temperature.explanation,
                    new.estimated_value_cents,
                    new.suggested_reply,
                    new.reply_rationale
                ],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(if inserted > 0 { Some(id) } else { None })
    }

    /// Whether any customer was ever surfaced for this instance. The scan
    /// runs once per instance and this is the marker it checks.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn has_any_for_instance(&self, tenant_id: &str, instance_id: &str) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM forgotten_customers WHERE tenant_id = ?1 AND instance_id = ?2",
                [tenant_id, instance_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(count > 0)
    }

    /// Best converted value for a contact across prior recoveries, if the
    /// contact ever converted
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn best_converted_value(&self, tenant_id: &str, contact_phone: &str) -> Result<Option<i64>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let value: Option<i64> = conn
            .query_row(
                "SELECT MAX(COALESCE(converted_value_cents, estimated_value_cents))
                 FROM forgotten_customers
                 WHERE tenant_id = ?1 AND contact_phone = ?2 AND status = 'converted'",
                [tenant_id, contact_phone],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(value)
    }

    /// List surfaced customers for a tenant, hottest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_tenant(&self, tenant_id: &str) -> Result<Vec<ForgottenCustomer>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, tenant_id, instance_id, contact_phone, contact_name, silent_side,
                        last_message, last_message_at, hours_of_silence, temperature,
                        temperature_label, temperature_emoji, temperature_explanation,
                        estimated_value_cents, suggested_reply, reply_rationale, status
                 FROM forgotten_customers WHERE tenant_id = ?1
                 ORDER BY temperature DESC, estimated_value_cents DESC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let rows = stmt
            .query_map([tenant_id], row_to_forgotten)
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(rows)
    }

    /// Fetch one surfaced customer by id, tenant scoped
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, tenant_id: &str, id: &str) -> Result<Option<ForgottenCustomer>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let row = conn
            .query_row(
                "SELECT id, tenant_id, instance_id, contact_phone, contact_name, silent_side,
                        last_message, last_message_at, hours_of_silence, temperature,
                        temperature_label, temperature_emoji, temperature_explanation,
                        estimated_value_cents, suggested_reply, reply_rationale, status
                 FROM forgotten_customers WHERE id = ?1 AND tenant_id = ?2",
                [id, tenant_id],
                row_to_forgotten,
            )
            .ok();

        Ok(row)
    }

    /// Move a surfaced customer through its lifecycle
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the row does not exist
    pub fn update_status(
        &self,
        tenant_id: &str,
        id: &str,
        status: RecoveryStatus,
        converted_value_cents: Option<i64>,
    ) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        let updated = conn
            .execute(
                "UPDATE forgotten_customers SET
                    status = ?3,
                    replied_at = CASE WHEN ?3 = 'replied' THEN ?4 ELSE replied_at END,
                    converted_at = CASE WHEN ?3 = 'converted' THEN ?4 ELSE converted_at END,
                    converted_value_cents = COALESCE(?5, converted_value_cents),
                    updated_at = ?4
                 WHERE id = ?1 AND tenant_id = ?2",
                rusqlite::params![id, tenant_id, status.as_str(), now, converted_value_cents],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if updated == 0 {
            return Err(Error::NotFound(format!("forgotten customer {id}")));
        }
        Ok(())
    }
}

fn row_to_forgotten(row: &rusqlite::Row<'_>) -> rusqlite::Result<ForgottenCustomer> {
    Ok(ForgottenCustomer {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        instance_id: row.get(2)?,
        contact_phone: row.get(3)?,
        contact_name: row.get(4)?,
        silent_side: row.get(5)?,
        last_message: row.get(6)?,
        last_message_at: parse_datetime(&row.get::<_, String>(7)?),
        hours_of_silence: row.get(8)?,
        temperature: row.get(9)?,
        temperature_label: row.get(10)?,
        temperature_emoji: row.get(11)?,
        temperature_explanation: row.get(12)?,
        estimated_value_cents: row.get(13)?,
        suggested_reply: row.get(14)?,
        reply_rationale: row.get(15)?,
        status: RecoveryStatus::from_str(&row.get::<_, String>(16)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;
    use crate::scoring::TemperatureResult;

    fn sample_temp() -> TemperatureResult {
        TemperatureResult {
            score: 8,
            label: "Hot".to_owned(),
            emoji: "🔥".to_owned(),
            explanation: "recent silence, buying intent".to_owned(),
            reasons: vec!["recent silence".to_owned(), "buying intent".to_owned()],
        }
    }

    #[test]
    fn insert_is_idempotent_per_contact() {
        let repo = ForgottenRepo::new(init_memory().unwrap());
        let temp = sample_temp();
        let new = NewForgotten {
            tenant_id: "org-1",
            instance_id: "inst-1",
            contact_phone: "5511988887777",
            contact_name: Some("Ana"),
            silent_side: "business",
            last_message: "quanto custa?",
            last_message_at: Utc::now(),
            hours_of_silence: 30,
            temperature: &temp,
            estimated_value_cents: 8_000,
            suggested_reply: "Oi Ana!",
            reply_rationale: "customer asked for a price",
        };

        assert!(repo.insert(&new).unwrap().is_some());
        assert!(repo.insert(&new).unwrap().is_none());
        assert!(repo.has_any_for_instance("org-1", "inst-1").unwrap());
        assert!(!repo.has_any_for_instance("org-1", "inst-2").unwrap());
    }

    #[test]
    fn status_transitions_stamp_timestamps() {
        let repo = ForgottenRepo::new(init_memory().unwrap());
        let temp = sample_temp();
        let id = repo
            .insert(&NewForgotten {
                tenant_id: "org-1",
                instance_id: "inst-1",
                contact_phone: "5511988887777",
                contact_name: None,
                silent_side: "customer",
                last_message: "vou pensar",
                last_message_at: Utc::now(),
                hours_of_silence: 50,
                temperature: &temp,
                estimated_value_cents: 5_000,
                suggested_reply: "",
                reply_rationale: "",
            })
            .unwrap()
            .unwrap();

        repo.update_status("org-1", &id, RecoveryStatus::Converted, Some(12_000))
            .unwrap();
        let rows = repo.list_for_tenant("org-1").unwrap();
        assert_eq!(rows[0].status, RecoveryStatus::Converted);

        let err = repo.update_status("org-1", "missing", RecoveryStatus::Ignored, None);
        assert!(err.is_err());
    }
}
