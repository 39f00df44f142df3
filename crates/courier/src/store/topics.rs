//! Topic and subscription operations.

use chrono::Utc;

use super::{map_unique_violation, MailStore, MailTx, TopicRow};
use crate::error::StoreError;
use crate::types::{inbox_topic_name, Agent, AgentId, Topic, TopicId, TopicType};

const TOPIC_COLS: &str = "id, name, topic_type, retention_secs, created_at";

impl MailStore {
    pub async fn create_topic(
        &self,
        name: &str,
        topic_type: TopicType,
        retention_secs: Option<i64>,
    ) -> Result<Topic, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO topics (name, topic_type, retention_secs, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(topic_type.as_str())
        .bind(retention_secs)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &format!("topic {name}")))?;

        Ok(Topic {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            topic_type,
            retention_secs,
            created_at: now,
        })
    }

    pub async fn get_topic(&self, id: TopicId) -> Result<Option<Topic>, StoreError> {
        let row = sqlx::query_as::<_, TopicRow>(&format!(
            "SELECT {TOPIC_COLS} FROM topics WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Topic::from))
    }

    pub async fn topic_by_name(&self, name: &str) -> Result<Option<Topic>, StoreError> {
        let row = sqlx::query_as::<_, TopicRow>(&format!(
            "SELECT {TOPIC_COLS} FROM topics WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Topic::from))
    }

    /// Fetch a topic by name, creating it with the given type if missing.
    pub async fn get_or_create_topic(
        &self,
        name: &str,
        topic_type: TopicType,
    ) -> Result<Topic, StoreError> {
        sqlx::query(
            "INSERT INTO topics (name, topic_type, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(topic_type.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, TopicRow>(&format!(
            "SELECT {TOPIC_COLS} FROM topics WHERE name = ?"
        ))
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    pub async fn list_topics(&self) -> Result<Vec<Topic>, StoreError> {
        let rows = sqlx::query_as::<_, TopicRow>(&format!(
            "SELECT {TOPIC_COLS} FROM topics ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Topic::from).collect())
    }

    pub async fn list_topics_by_type(&self, topic_type: TopicType) -> Result<Vec<Topic>, StoreError> {
        let rows = sqlx::query_as::<_, TopicRow>(&format!(
            "SELECT {TOPIC_COLS} FROM topics WHERE topic_type = ? ORDER BY name"
        ))
        .bind(topic_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Topic::from).collect())
    }

    /// Message counts per topic, for topic listings.
    pub async fn topic_message_counts(&self) -> Result<Vec<(TopicId, i64)>, StoreError> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT topic_id, COUNT(*) FROM messages GROUP BY topic_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- subscriptions -------------------------------------------------------

    /// Add a subscription. Inserting an existing pair is a no-op.
    pub async fn subscribe(&self, agent_id: AgentId, topic_id: TopicId) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO subscriptions (agent_id, topic_id, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(agent_id, topic_id) DO NOTHING",
        )
        .bind(agent_id)
        .bind(topic_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a subscription. Removing a missing pair succeeds.
    pub async fn unsubscribe(&self, agent_id: AgentId, topic_id: TopicId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM subscriptions WHERE agent_id = ? AND topic_id = ?")
            .bind(agent_id)
            .bind(topic_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Topic ids the agent is subscribed to.
    pub async fn subscriptions_by_agent(&self, agent_id: AgentId) -> Result<Vec<TopicId>, StoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT topic_id FROM subscriptions WHERE agent_id = ? ORDER BY topic_id",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Agent ids subscribed to a topic.
    pub async fn subscribers_of_topic(&self, topic_id: TopicId) -> Result<Vec<AgentId>, StoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT agent_id FROM subscriptions WHERE topic_id = ? ORDER BY agent_id",
        )
        .bind(topic_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

impl MailTx {
    pub async fn topic_by_name(&mut self, name: &str) -> Result<Option<Topic>, StoreError> {
        let row = sqlx::query_as::<_, TopicRow>(&format!(
            "SELECT {TOPIC_COLS} FROM topics WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Topic::from))
    }

    /// Fetch an agent's inbox topic, creating it on first use.
    pub async fn get_or_create_agent_inbox(&mut self, agent: &Agent) -> Result<Topic, StoreError> {
        let name = inbox_topic_name(&agent.name);
        sqlx::query(
            "INSERT INTO topics (name, topic_type, created_at) VALUES (?, 'inbox', ?) \
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(&name)
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;

        let row = sqlx::query_as::<_, TopicRow>(&format!(
            "SELECT {TOPIC_COLS} FROM topics WHERE name = ?"
        ))
        .bind(&name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.into())
    }

    pub async fn subscribers_of_topic(&mut self, topic_id: TopicId) -> Result<Vec<AgentId>, StoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT agent_id FROM subscriptions WHERE topic_id = ? ORDER BY agent_id",
        )
        .bind(topic_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MailStore;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = MailStore::open_memory().await.unwrap();
        let first = store
            .get_or_create_topic("announcements", TopicType::Broadcast)
            .await
            .unwrap();
        let second = store
            .get_or_create_topic("announcements", TopicType::Broadcast)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_topics().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscriptions_are_idempotent_sets() {
        let store = MailStore::open_memory().await.unwrap();
        let topic = store
            .get_or_create_topic("builds", TopicType::Broadcast)
            .await
            .unwrap();

        store.subscribe(1, topic.id).await.unwrap();
        store.subscribe(1, topic.id).await.unwrap();
        store.subscribe(2, topic.id).await.unwrap();

        assert_eq!(store.subscribers_of_topic(topic.id).await.unwrap(), vec![1, 2]);
        assert_eq!(store.subscriptions_by_agent(1).await.unwrap(), vec![topic.id]);

        store.unsubscribe(1, topic.id).await.unwrap();
        // Unsubscribing twice is fine.
        store.unsubscribe(1, topic.id).await.unwrap();
        assert_eq!(store.subscribers_of_topic(topic.id).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn inbox_topic_created_once_per_agent() {
        let store = MailStore::open_memory().await.unwrap();
        let agent = store.create_agent("alice", None, None).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let inbox = tx.get_or_create_agent_inbox(&agent).await.unwrap();
        let again = tx.get_or_create_agent_inbox(&agent).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(inbox.id, again.id);
        assert_eq!(inbox.name, "inbox-alice");
        assert_eq!(inbox.topic_type, TopicType::Inbox);
    }

    #[tokio::test]
    async fn list_by_type_filters() {
        let store = MailStore::open_memory().await.unwrap();
        store
            .create_topic("builds", TopicType::Broadcast, None)
            .await
            .unwrap();
        store
            .create_topic("inbox-bob", TopicType::Inbox, None)
            .await
            .unwrap();

        let broadcast = store.list_topics_by_type(TopicType::Broadcast).await.unwrap();
        assert_eq!(broadcast.len(), 1);
        assert_eq!(broadcast[0].name, "builds");
    }
}
