//! Agent directory operations.
//!
//! Agents are registered by the surrounding system; the mail core mostly
//! resolves them by id or name when routing messages.

use chrono::Utc;

use super::{map_unique_violation, AgentRow, MailStore, MailTx};
use crate::error::StoreError;
use crate::types::{Agent, AgentId};

const AGENT_COLS: &str =
    "id, name, project_key, git_branch, current_session_id, created_at, last_active_at";

impl MailStore {
    /// Register a new agent. Names are unique; a duplicate surfaces as a
    /// conflict.
    pub async fn create_agent(
        &self,
        name: &str,
        project_key: Option<&str>,
        git_branch: Option<&str>,
    ) -> Result<Agent, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO agents (name, project_key, git_branch, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(project_key)
        .bind(git_branch)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &format!("agent {name}")))?;

        Ok(Agent {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            project_key: project_key.map(str::to_string),
            git_branch: git_branch.map(str::to_string),
            current_session_id: None,
            created_at: now,
            last_active_at: None,
        })
    }

    pub async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLS} FROM agents WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Agent::from))
    }

    pub async fn agent_by_name(&self, name: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLS} FROM agents WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Agent::from))
    }

    pub async fn agent_by_session(&self, session_id: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLS} FROM agents WHERE current_session_id = ?"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Agent::from))
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLS} FROM agents ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Agent::from).collect())
    }

    /// Case-insensitive substring search over agent names.
    pub async fn search_agents(&self, query: &str) -> Result<Vec<Agent>, StoreError> {
        let pattern = format!("%{query}%");
        let rows = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLS} FROM agents WHERE name LIKE ? ORDER BY name"
        ))
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Agent::from).collect())
    }

    /// Remove an agent registration. Returns whether a row was deleted.
    pub async fn delete_agent(&self, id: AgentId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_last_active(&self, id: AgentId) -> Result<(), StoreError> {
        sqlx::query("UPDATE agents SET last_active_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_session(
        &self,
        id: AgentId,
        session_id: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE agents SET current_session_id = ? WHERE id = ?")
            .bind(session_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_agent_name(&self, id: AgentId, name: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE agents SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, &format!("agent {name}")))?;
        Ok(())
    }
}

impl MailTx {
    pub async fn get_agent(&mut self, id: AgentId) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLS} FROM agents WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Agent::from))
    }

    pub async fn agent_by_name(&mut self, name: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLS} FROM agents WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Agent::from))
    }
}

#[cfg(test)]
mod tests {
    use crate::error::StoreError;
    use crate::store::MailStore;

    #[tokio::test]
    async fn create_and_resolve_agent() {
        let store = MailStore::open_memory().await.unwrap();
        let agent = store
            .create_agent("alice", Some("proj"), Some("main"))
            .await
            .unwrap();
        assert!(agent.id > 0);

        let by_id = store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(by_id.name, "alice");
        let by_name = store.agent_by_name("alice").await.unwrap().unwrap();
        assert_eq!(by_name.id, agent.id);
        assert_eq!(by_name.project_key.as_deref(), Some("proj"));
    }

    #[tokio::test]
    async fn duplicate_name_is_a_conflict() {
        let store = MailStore::open_memory().await.unwrap();
        store.create_agent("alice", None, None).await.unwrap();
        let err = store.create_agent("alice", None, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn session_round_trip() {
        let store = MailStore::open_memory().await.unwrap();
        let agent = store.create_agent("bob", None, None).await.unwrap();

        store
            .update_session(agent.id, Some("sess-1"))
            .await
            .unwrap();
        let found = store.agent_by_session("sess-1").await.unwrap().unwrap();
        assert_eq!(found.id, agent.id);

        store.update_session(agent.id, None).await.unwrap();
        assert!(store.agent_by_session("sess-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_and_delete() {
        let store = MailStore::open_memory().await.unwrap();
        store.create_agent("worker-1", None, None).await.unwrap();
        store.create_agent("worker-2", None, None).await.unwrap();
        let other = store.create_agent("scout", None, None).await.unwrap();

        let hits = store.search_agents("worker").await.unwrap();
        assert_eq!(hits.len(), 2);

        assert!(store.delete_agent(other.id).await.unwrap());
        assert!(!store.delete_agent(other.id).await.unwrap());
        assert_eq!(store.list_agents().await.unwrap().len(), 2);
    }
}
