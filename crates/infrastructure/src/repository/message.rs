use async_trait::async_trait;
use chrono::Duration;
use domain::{
    ConversationId, Cursor, Message, MessageId, MessageRepository, MessageViewer, Reaction,
    ReactionToggle, RepositoryError, RepositoryResult, SenderHistory, Timestamp, UserId,
};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use super::map_sqlx_err;
use super::records::{
    count_to_u32, group_reactions, MessageRecord, ReactionRecord, SenderHistoryRecord,
    MESSAGE_COLUMNS,
};

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn reactions_for(&self, ids: &[Uuid]) -> RepositoryResult<Vec<ReactionRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, ReactionRecord>(
            r#"
            SELECT message_id, user_id, emoji, created_at
            FROM message_reactions
            WHERE message_id = ANY($1)
            ORDER BY created_at, user_id, emoji
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    async fn hydrate(&self, records: Vec<MessageRecord>) -> RepositoryResult<Vec<Message>> {
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let mut reactions = group_reactions(self.reactions_for(&ids).await?);
        Ok(records
            .into_iter()
            .map(|record| {
                let own = reactions.remove(&record.id).unwrap_or_default();
                record.into_message(own)
            })
            .collect())
    }

    async fn load(&self, id: Uuid) -> RepositoryResult<Option<Message>> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match record {
            Some(record) => Ok(self.hydrate(vec![record]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn exists(&self, id: Uuid) -> RepositoryResult<bool> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM messages WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)
    }

    async fn current_reactions(&self, id: Uuid) -> RepositoryResult<Vec<Reaction>> {
        Ok(self
            .reactions_for(&[id])
            .await?
            .into_iter()
            .map(Reaction::from)
            .collect())
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn insert(&self, message: &Message) -> RepositoryResult<Message> {
        sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, sender_id, sender_name, content, content_sanitized,
                 attachments, edit_history, spam_score, is_spam, is_edited, is_deleted,
                 deleted_by, deleted_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.conversation_id))
        .bind(Uuid::from(message.sender_id))
        .bind(message.sender_name.as_deref())
        .bind(&message.content)
        .bind(&message.content_sanitized)
        .bind(Json(&message.attachments))
        .bind(Json(&message.edit_history))
        .bind(i16::from(message.spam_score))
        .bind(message.is_spam)
        .bind(message.is_edited)
        .bind(message.is_deleted)
        .bind(message.deleted_by.map(Uuid::from))
        .bind(message.deleted_at)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(message.clone())
    }

    async fn find_by_id(&self, id: MessageId) -> RepositoryResult<Option<Message>> {
        self.load(Uuid::from(id)).await
    }

    async fn apply_edit(
        &self,
        message: &Message,
        expected_edit_count: u32,
    ) -> RepositoryResult<Option<Message>> {
        let id = Uuid::from(message.id);
        let updated = sqlx::query(
            r#"
            UPDATE messages
            SET content = $2,
                content_sanitized = $3,
                edit_history = $4,
                is_edited = TRUE,
                updated_at = $5
            WHERE id = $1
              AND NOT is_deleted
              AND jsonb_array_length(edit_history) = $6
            "#,
        )
        .bind(id)
        .bind(&message.content)
        .bind(&message.content_sanitized)
        .bind(Json(&message.edit_history))
        .bind(message.updated_at)
        .bind(i32::try_from(expected_edit_count).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if updated.rows_affected() == 0 {
            if !self.exists(id).await? {
                return Err(RepositoryError::NotFound);
            }
            return Ok(None);
        }
        self.load(id).await
    }

    async fn soft_delete(
        &self,
        id: MessageId,
        deleted_by: UserId,
        at: Timestamp,
    ) -> RepositoryResult<Option<Message>> {
        let id = Uuid::from(id);
        let updated = sqlx::query(
            r#"
            UPDATE messages
            SET is_deleted = TRUE, deleted_by = $2, deleted_at = $3, updated_at = $3
            WHERE id = $1 AND NOT is_deleted
            "#,
        )
        .bind(id)
        .bind(Uuid::from(deleted_by))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if updated.rows_affected() == 0 {
            if !self.exists(id).await? {
                return Err(RepositoryError::NotFound);
            }
            return Ok(None);
        }
        self.load(id).await
    }

    async fn toggle_reaction(
        &self,
        id: MessageId,
        user_id: UserId,
        emoji: &str,
        at: Timestamp,
    ) -> RepositoryResult<ReactionToggle> {
        let message_id = Uuid::from(id);
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let removed = sqlx::query(
            "DELETE FROM message_reactions WHERE message_id = $1 AND user_id = $2 AND emoji = $3",
        )
        .bind(message_id)
        .bind(Uuid::from(user_id))
        .bind(emoji)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let added = removed.rows_affected() == 0;
        if added {
            sqlx::query(
                r#"
                INSERT INTO message_reactions (message_id, user_id, emoji, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(message_id)
            .bind(Uuid::from(user_id))
            .bind(emoji)
            .bind(at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }
        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(ReactionToggle {
            added,
            reactions: self.current_reactions(message_id).await?,
        })
    }

    async fn list_page(
        &self,
        conversation_id: ConversationId,
        viewer: MessageViewer,
        cursor: Option<Cursor>,
        limit: u32,
    ) -> RepositoryResult<Vec<Message>> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages m
            WHERE m.conversation_id = $1
              AND (NOT m.is_spam OR $2 OR m.sender_id = $3)
              AND ($4::timestamptz IS NULL OR (m.created_at, m.id) < ($4, $5))
            ORDER BY m.created_at DESC, m.id DESC
            LIMIT $6
            "#
        ))
        .bind(Uuid::from(conversation_id))
        .bind(viewer.include_all_spam)
        .bind(Uuid::from(viewer.user_id))
        .bind(cursor.map(|c| c.timestamp))
        .bind(cursor.map(|c| c.id))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        self.hydrate(records).await
    }

    async fn search(
        &self,
        user_id: UserId,
        query: &str,
        limit: u32,
    ) -> RepositoryResult<Vec<Message>> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages m
            JOIN conversations c ON c.id = m.conversation_id AND c.status <> 'deleted'
            JOIN conversation_participants p ON p.conversation_id = c.id AND p.user_id = $1
            WHERE NOT m.is_deleted
              AND (NOT m.is_spam OR m.sender_id = $1)
              AND to_tsvector('simple', m.content_sanitized || ' ' || COALESCE(m.sender_name, ''))
                  @@ plainto_tsquery('simple', $2)
            ORDER BY m.created_at DESC, m.id DESC
            LIMIT $3
            "#
        ))
        .bind(Uuid::from(user_id))
        .bind(query)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        self.hydrate(records).await
    }

    async fn sender_history(
        &self,
        sender_id: UserId,
        now: Timestamp,
    ) -> RepositoryResult<SenderHistory> {
        let record = sqlx::query_as::<_, SenderHistoryRecord>(
            r#"
            SELECT COUNT(*) FILTER (WHERE created_at > $2) AS messages_last_minute,
                   COUNT(*) AS messages_last_day,
                   COUNT(*) FILTER (WHERE is_spam) AS spam_flagged_last_day
            FROM messages
            WHERE sender_id = $1 AND created_at > $3
            "#,
        )
        .bind(Uuid::from(sender_id))
        .bind(now - Duration::minutes(1))
        .bind(now - Duration::days(1))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(SenderHistory {
            messages_last_minute: count_to_u32(record.messages_last_minute),
            messages_last_day: count_to_u32(record.messages_last_day),
            spam_flagged_last_day: count_to_u32(record.spam_flagged_last_day),
        })
    }
}
