//! Instance repository — mirrors connection state into durable storage

use chrono::{DateTime, Utc};

use super::{parse_datetime, DbPool};
use crate::session::ConnectionStatus;
use crate::{Error, Result};

/// A persisted chat-protocol instance record
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub id: String,
    pub tenant_id: String,
    pub status: ConnectionStatus,
    pub phone_number: Option<String>,
    pub last_error: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

/// Instance repository
#[derive(Clone)]
pub struct InstanceRepo {
    pool: DbPool,
}

impl InstanceRepo {
    /// Create a new instance repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a connection-state transition for an instance, creating the
    /// row on first sight
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn upsert_status(
        &self,
        tenant_id: &str,
        instance_id: &str,
        status: ConnectionStatus,
        phone_number: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        let connected_at = if status == ConnectionStatus::Connected {
            Some(now.clone())
        } else {
            None
        };

        conn.execute(
            "INSERT INTO instances (id, tenant_id, status, phone_number, last_error, last_connected_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                phone_number = COALESCE(excluded.phone_number, instances.phone_number),
                last_error = excluded.last_error,
                last_connected_at = COALESCE(excluded.last_connected_at, instances.last_connected_at),
                updated_at = excluded.updated_at",
            rusqlite::params![
                instance_id,
                tenant_id,
                status.as_str(),
                phone_number,
                last_error,
                connected_at,
                now
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Look up an instance record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, tenant_id: &str, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let record = conn
            .query_row(
                "SELECT id, tenant_id, status, phone_number, last_error, last_connected_at
                 FROM instances WHERE id = ?1 AND tenant_id = ?2",
                [instance_id, tenant_id],
                |row| {
                    Ok(InstanceRecord {
                        id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        status: ConnectionStatus::from_str(&row.get::<_, String>(2)?),
                        phone_number: row.get(3)?,
                        last_error: row.get(4)?,
                        last_connected_at: row
                            .get::<_, Option<String>>(5)?
                            .map(|s| parse_datetime(&s)),
                    })
                },
            )
            .ok();

        Ok(record)
    }

    /// Tenant that owns an instance, regardless of connection state
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn owner_of(&self, instance_id: &str) -> Result<Option<String>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.query_row(
            "SELECT tenant_id FROM instances WHERE id = ?1",
            [instance_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| {
            if e == rusqlite::Error::QueryReturnedNoRows {
                Ok(None)
            } else {
                Err(Error::Database(e.to_string()))
            }
        })
    }

    /// List instances for a tenant
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_tenant(&self, tenant_id: &str) -> Result<Vec<InstanceRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, tenant_id, status, phone_number, last_error, last_connected_at
                 FROM instances WHERE tenant_id = ?1 ORDER BY updated_at DESC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let records = stmt
            .query_map([tenant_id], |row| {
                Ok(InstanceRecord {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    status: ConnectionStatus::from_str(&row.get::<_, String>(2)?),
                    phone_number: row.get(3)?,
                    last_error: row.get(4)?,
                    last_connected_at: row
                        .get::<_, Option<String>>(5)?
                        .map(|s| parse_datetime(&s)),
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[test]
    fn upsert_creates_then_updates() {
        let repo = InstanceRepo::new(init_memory().unwrap());

        repo.upsert_status("org-1", "inst-1", ConnectionStatus::Connecting, None, None)
            .unwrap();
        let rec = repo.find("org-1", "inst-1").unwrap().unwrap();
        assert_eq!(rec.status, ConnectionStatus::Connecting);
        assert!(rec.last_connected_at.is_none());

        repo.upsert_status(
            "org-1",
            "inst-1",
            ConnectionStatus::Connected,
            Some("5511999990000"),
            None,
        )
        .unwrap();
        let rec = repo.find("org-1", "inst-1").unwrap().unwrap();
        assert_eq!(rec.status, ConnectionStatus::Connected);
        assert_eq!(rec.phone_number.as_deref(), Some("5511999990000"));
        assert!(rec.last_connected_at.is_some());
    }

    #[test]
    fn find_is_tenant_scoped() {
        let repo = InstanceRepo::new(init_memory().unwrap());
        repo.upsert_status("org-1", "inst-1", ConnectionStatus::Connected, None, None)
            .unwrap();
        assert!(repo.find("org-2", "inst-1").unwrap().is_none());
    }

    #[test]
    fn owner_of_resolves_offline_instances() {
        let repo = InstanceRepo::new(init_memory().unwrap());
        repo.upsert_status("org-1", "inst-1", ConnectionStatus::Disconnected, None, None)
            .unwrap();

        assert_eq!(repo.owner_of("inst-1").unwrap().as_deref(), Some("org-1"));
        assert!(repo.owner_of("inst-9").unwrap().is_none());
    }
}
