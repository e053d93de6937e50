//! Expense storage

use super::id_map;
use super::models::{EntityKind, Expense, NewExpense};
use super::repository::Repository;
use crate::config::DEFAULT_EXPENSE_CATEGORY;
use crate::error::{AppError, Result};
use chrono::Utc;
use uuid::Uuid;

impl Repository {
    /// Store an expense under a local id
    pub async fn create_expense(&self, input: &NewExpense) -> Result<Expense> {
        if input.amount_cents <= 0 {
            return Err(AppError::Validation(
                "Expense amount must be positive".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let category = match input.category.trim() {
            "" => DEFAULT_EXPENSE_CATEGORY,
            category => category,
        };
        let (receipt_base64, receipt_mime) = match &input.receipt {
            Some(receipt) => (Some(&receipt.base64), Some(&receipt.mime)),
            None => (None, None),
        };

        let expense = sqlx::query_as::<_, Expense>(
            r#"
            INSERT INTO expenses (id, ts, category, amount_cents, note, receipt_base64, receipt_mime, synced)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(input.ts.unwrap_or_else(Utc::now))
        .bind(category)
        .bind(input.amount_cents)
        .bind(&input.note)
        .bind(receipt_base64)
        .bind(receipt_mime)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!("Created expense: {} ({} cents)", id, input.amount_cents);
        Ok(expense)
    }

    pub async fn get_expense(&self, id: &str) -> Result<Option<Expense>> {
        let expense = sqlx::query_as::<_, Expense>("SELECT * FROM expenses WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(expense)
    }

    /// Newest first
    pub async fn list_expenses(&self, limit: i64) -> Result<Vec<Expense>> {
        let expenses = sqlx::query_as::<_, Expense>(
            "SELECT * FROM expenses ORDER BY ts DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(expenses)
    }

    /// Confirm an expense the server accepted.
    ///
    /// Swaps in the server id when one is given. Once the server holds the
    /// receipt, the local copy of the image is dropped.
    pub async fn mark_expense_synced(
        &self,
        local_id: &str,
        server_id: Option<&str>,
        receipt_url: Option<&str>,
    ) -> Result<Expense> {
        let id = server_id.unwrap_or(local_id);
        let mut tx = self.pool.begin().await?;

        let expense = sqlx::query_as::<_, Expense>(
            r#"
            UPDATE expenses
            SET id = ?,
                synced = 1,
                receipt_url = COALESCE(?, receipt_url),
                receipt_base64 = CASE WHEN ? IS NULL THEN receipt_base64 ELSE NULL END
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(receipt_url)
        .bind(receipt_url)
        .bind(local_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::ExpenseNotFound(local_id.to_string()))?;

        if id != local_id {
            id_map::save_with(&mut tx, EntityKind::Expense, local_id, id).await?;
        }

        tx.commit().await?;

        tracing::debug!("Expense {} synced as {}", local_id, id);
        Ok(expense)
    }
}
