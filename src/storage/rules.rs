use anyhow::Result;

use super::db::Database;
use super::types::RuleRow;

impl Database {
    // ========================================================================
    // Rule Operations
    // ========================================================================

    /// All rules in evaluation order.
    pub async fn list_rules(&self) -> Result<Vec<RuleRow>> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            "SELECT id, order_rank, enabled, definition_json FROM rules ORDER BY order_rank, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Insert a rule at the given rank, returning its id.
    pub async fn insert_rule(&self, order_rank: i64, definition_json: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO rules (order_rank, definition_json) VALUES (?, ?) RETURNING id",
        )
        .bind(order_rank)
        .bind(definition_json)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Enable or disable a rule. The rules engine also calls this when a
    /// rule's regex fails to compile.
    pub async fn set_rule_enabled(&self, rule_id: i64, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE rules SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a rule.
    pub async fn delete_rule(&self, rule_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM rules WHERE id = ?")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
