//! Owner-number repository
//!
//! Messages sent from an owner number are routed straight through the
//! instance instead of triggering automated handling.

use uuid::Uuid;

use super::DbPool;
use crate::{Error, Result};

/// Owner-number repository
#[derive(Clone)]
pub struct OwnerRepo {
    pool: DbPool,
}

impl OwnerRepo {
    /// Create a new owner-number repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Register a phone number as an owner for the tenant
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn register(&self, tenant_id: &str, phone_number: &str, owner_name: Option<&str>) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO owner_numbers (id, tenant_id, phone_number, owner_name)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tenant_id, phone_number) DO UPDATE SET
                owner_name = COALESCE(excluded.owner_name, owner_numbers.owner_name),
                is_active = 1",
            rusqlite::params![Uuid::new_v4().to_string(), tenant_id, phone_number, owner_name],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Whether the number belongs to an active owner of the tenant
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn is_owner(&self, tenant_id: &str, phone_number: &str) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM owner_numbers
                 WHERE tenant_id = ?1 AND phone_number = ?2 AND is_active = 1",
                [tenant_id, phone_number],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(count > 0)
    }

    /// Deactivate an owner number
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn deactivate(&self, tenant_id: &str, phone_number: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE owner_numbers SET is_active = 0 WHERE tenant_id = ?1 AND phone_number = ?2",
            [tenant_id, phone_number],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[test]
    fn register_and_deactivate() {
        let repo = OwnerRepo::new(init_memory().unwrap());

        repo.register("org-1", "5511999990000", Some("Bruno")).unwrap();
        assert!(repo.is_owner("org-1", "5511999990000").unwrap());
        assert!(!repo.is_owner("org-2", "5511999990000").unwrap());

        repo.deactivate("org-1", "5511999990000").unwrap();
        assert!(!repo.is_owner("org-1", "5511999990000").unwrap());

        // re-register flips it back on
        repo.register("org-1", "5511999990000", None).unwrap();
        assert!(repo.is_owner("org-1", "5511999990000").unwrap());
    }
}
