//! Expenses service
//!
//! Expenses are saved locally first and then sent like every other
//! mutation, receipt image included.

use super::dispatch::{Dispatcher, Mutation, Outcome};
use crate::api::CreateExpenseRequest;
use crate::database::{Expense, NewExpense, Repository};
use crate::error::{AppError, Result};

#[derive(Clone)]
pub struct ExpensesService {
    repo: Repository,
    dispatcher: Dispatcher,
}

impl ExpensesService {
    pub fn new(repo: Repository, dispatcher: Dispatcher) -> Self {
        Self { repo, dispatcher }
    }

    /// Save an expense and send it to the server.
    ///
    /// Returns the expense as stored after the attempt, so a confirmed
    /// expense already carries its server id.
    pub async fn create_expense(&self, input: NewExpense) -> Result<(Expense, Outcome)> {
        let expense = self.repo.create_expense(&input).await?;
        tracing::info!(
            "Created expense {} ({}, {} cents)",
            expense.id,
            expense.category,
            expense.amount_cents
        );

        let request = CreateExpenseRequest {
            ts: Some(expense.ts),
            category: expense.category.clone(),
            amount_cents: expense.amount_cents,
            note: expense.note.clone(),
            receipt_base64: expense.receipt_base64.clone(),
            receipt_mime: expense.receipt_mime.clone(),
        };
        let outcome = self
            .dispatcher
            .dispatch(Mutation::expense_create(&expense.id, &request)?)
            .await?;

        let current_id = match &outcome {
            Outcome::Confirmed(id) => id.as_str(),
            Outcome::Queued(_) => expense.id.as_str(),
        };
        let stored = self
            .repo
            .get_expense(current_id)
            .await?
            .ok_or_else(|| AppError::ExpenseNotFound(current_id.to_string()))?;

        Ok((stored, outcome))
    }

    pub async fn get_expense(&self, id: &str) -> Result<Expense> {
        self.repo
            .get_expense(id)
            .await?
            .ok_or_else(|| AppError::ExpenseNotFound(id.to_string()))
    }

    /// Newest first
    pub async fn list_expenses(&self, limit: i64) -> Result<Vec<Expense>> {
        self.repo.list_expenses(limit).await
    }
}
