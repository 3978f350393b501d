use async_trait::async_trait;
use domain::{
    AdminConversationFilter, Conversation, ConversationFilter, ConversationId,
    ConversationRepository, ConversationStatus, Cursor, MessageAggregate, Participant,
    ParticipantSettings, RepositoryError, RepositoryResult, Timestamp, UnreadSummary, UserId,
    DELETED_PLACEHOLDER,
};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::records::{
    group_participants, ConversationRecord, MessageRecord, ParticipantRecord,
    UnreadSummaryRecord, CONVERSATION_COLUMNS, MESSAGE_COLUMNS, PARTICIPANT_COLUMNS,
};
use super::{invalid_data, map_sqlx_err};

#[derive(Clone)]
pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 为会话行补齐参与者，保持行的原有顺序
    async fn hydrate(&self, records: Vec<ConversationRecord>) -> RepositoryResult<Vec<Conversation>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let participants = sqlx::query_as::<_, ParticipantRecord>(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM conversation_participants \
             WHERE conversation_id = ANY($1) ORDER BY conversation_id, position"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut grouped = group_participants(participants)?;
        records
            .into_iter()
            .map(|record| {
                let participants = grouped.remove(&record.id).unwrap_or_default();
                record.into_conversation(participants)
            })
            .collect()
    }

    async fn load(&self, id: Uuid) -> RepositoryResult<Option<Conversation>> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = $1"
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

    async fn load_by_direct_key(&self, key: &str) -> RepositoryResult<Option<Conversation>> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
             WHERE c.direct_key = $1 AND c.type = 'direct' AND c.status <> 'deleted'"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match record {
            Some(record) => Ok(self.hydrate(vec![record]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn insert_participants(
        tx: &mut Transaction<'_, Postgres>,
        conversation: &Conversation,
    ) -> RepositoryResult<()> {
        for (position, participant) in conversation.participants.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO conversation_participants
                    (conversation_id, user_id, position, display_name, role,
                     is_pinned, is_muted, is_archived, unread_count, last_read_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(Uuid::from(conversation.id))
            .bind(Uuid::from(participant.user_id))
            .bind(i16::try_from(position).unwrap_or(i16::MAX))
            .bind(participant.display_name.as_deref())
            .bind(participant.role.as_str())
            .bind(participant.is_pinned)
            .bind(participant.is_muted)
            .bind(participant.is_archived)
            .bind(i32::try_from(participant.unread_count).unwrap_or(i32::MAX))
            .bind(participant.last_read_at)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_err)?;
        }
        Ok(())
    }

    /// 插入会话行；direct 会话键冲突时返回 `false`
    async fn insert_conversation(
        tx: &mut Transaction<'_, Postgres>,
        conversation: &Conversation,
    ) -> RepositoryResult<bool> {
        let context = conversation.context.as_ref();
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO conversations
                (id, type, status, context_type, context_ref_id, context_title,
                 direct_key, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (direct_key) WHERE type = 'direct' AND status <> 'deleted' DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::from(conversation.id))
        .bind(conversation.kind.as_str())
        .bind(conversation.status.as_str())
        .bind(context.map(|ctx| ctx.kind.as_str()))
        .bind(context.map(|ctx| ctx.referenced_id.as_str()))
        .bind(context.and_then(|ctx| ctx.title.as_deref()))
        .bind(conversation.direct_key())
        .bind(Uuid::from(conversation.created_by))
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(inserted.is_some())
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn create(&self, conversation: &Conversation) -> RepositoryResult<Conversation> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        if !Self::insert_conversation(&mut tx, conversation).await? {
            return Err(RepositoryError::Conflict);
        }
        Self::insert_participants(&mut tx, conversation).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(conversation.clone())
    }

    async fn create_direct(
        &self,
        conversation: &Conversation,
    ) -> RepositoryResult<(Conversation, bool)> {
        let key = conversation
            .direct_key()
            .ok_or_else(|| invalid_data("not a direct conversation"))?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        if Self::insert_conversation(&mut tx, conversation).await? {
            Self::insert_participants(&mut tx, conversation).await?;
            tx.commit().await.map_err(map_sqlx_err)?;
            return Ok((conversation.clone(), true));
        }
        tx.rollback().await.map_err(map_sqlx_err)?;

        let existing = self
            .load_by_direct_key(&key)
            .await?
            .ok_or(RepositoryError::Conflict)?;
        Ok((existing, false))
    }

    async fn find_by_id(&self, id: ConversationId) -> RepositoryResult<Option<Conversation>> {
        self.load(Uuid::from(id)).await
    }

    async fn find_direct(&self, a: UserId, b: UserId) -> RepositoryResult<Option<Conversation>> {
        self.load_by_direct_key(&domain::direct_key_for(a, b)).await
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        filter: &ConversationFilter,
        cursor: Option<Cursor>,
        limit: u32,
    ) -> RepositoryResult<Vec<Conversation>> {
        let records = sqlx::query_as::<_, ConversationRecord>(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS}
            FROM conversations c
            JOIN conversation_participants p
              ON p.conversation_id = c.id AND p.user_id = $1
            WHERE c.status <> 'deleted'
              AND ($2::text IS NULL OR c.status = $2)
              AND ($3::text IS NULL OR c.type = $3)
              AND ($4::bool IS NULL OR p.is_archived = $4)
              AND ($5::bool IS NULL OR p.is_pinned = $5)
              AND ($6::text IS NULL OR c.context_type = $6)
              AND ($7::text IS NULL OR c.context_ref_id = $7)
              AND ($8::timestamptz IS NULL OR (c.updated_at, c.id) < ($8, $9))
            ORDER BY c.updated_at DESC, c.id DESC
            LIMIT $10
            "#
        ))
        .bind(Uuid::from(user_id))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.archived)
        .bind(filter.pinned)
        .bind(filter.context_type.map(|k| k.as_str()))
        .bind(filter.context_id.as_deref())
        .bind(cursor.map(|c| c.timestamp))
        .bind(cursor.map(|c| c.id))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        self.hydrate(records).await
    }

    async fn record_message(&self, aggregate: &MessageAggregate) -> RepositoryResult<()> {
        let last = &aggregate.last_message;
        let conversation_id = Uuid::from(aggregate.conversation_id);
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM conversations WHERE id = $1)")
                .bind(conversation_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
        if !exists {
            return Err(RepositoryError::NotFound);
        }

        // 摘要只会前移，提交顺序与时间戳不一致时保留较新的消息
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message_preview = $2,
                last_message_sender_id = $3,
                last_message_at = $4,
                updated_at = GREATEST(updated_at, $4)
            WHERE id = $1
              AND (last_message_at IS NULL OR last_message_at <= $4)
            "#,
        )
        .bind(conversation_id)
        .bind(&last.content_preview)
        .bind(Uuid::from(last.sender_id))
        .bind(last.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            UPDATE conversation_participants
            SET unread_count = unread_count + 1
            WHERE conversation_id = $1 AND user_id <> $2
            "#,
        )
        .bind(conversation_id)
        .bind(Uuid::from(last.sender_id))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn refresh_last_message(&self, aggregate: &MessageAggregate) -> RepositoryResult<()> {
        let last = &aggregate.last_message;
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message_preview = $4
            WHERE id = $1 AND last_message_sender_id = $2 AND last_message_at = $3
            "#,
        )
        .bind(Uuid::from(aggregate.conversation_id))
        .bind(Uuid::from(last.sender_id))
        .bind(last.timestamp)
        .bind(&last.content_preview)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn retract_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        created_at: Timestamp,
    ) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            UPDATE conversation_participants
            SET unread_count = GREATEST(unread_count - 1, 0)
            WHERE conversation_id = $1
              AND user_id <> $2
              AND (last_read_at IS NULL OR last_read_at < $3)
            "#,
        )
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(sender_id))
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message_preview = $4
            WHERE id = $1 AND last_message_sender_id = $2 AND last_message_at = $3
            "#,
        )
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(sender_id))
        .bind(created_at)
        .bind(DELETED_PLACEHOLDER)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: Timestamp,
    ) -> RepositoryResult<Option<Participant>> {
        let record = sqlx::query_as::<_, ParticipantRecord>(&format!(
            r#"
            UPDATE conversation_participants
            SET unread_count = 0, last_read_at = $3
            WHERE conversation_id = $1 AND user_id = $2
            RETURNING {PARTICIPANT_COLUMNS}
            "#
        ))
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(user_id))
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Participant::try_from).transpose()
    }

    async fn update_settings(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        settings: &ParticipantSettings,
        _now: Timestamp,
    ) -> RepositoryResult<Option<Conversation>> {
        let updated = sqlx::query(
            r#"
            UPDATE conversation_participants
            SET is_pinned = COALESCE($3, is_pinned),
                is_muted = COALESCE($4, is_muted),
                is_archived = COALESCE($5, is_archived)
            WHERE conversation_id = $1 AND user_id = $2
            "#,
        )
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(user_id))
        .bind(settings.is_pinned)
        .bind(settings.is_muted)
        .bind(settings.is_archived)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.load(Uuid::from(conversation_id)).await
    }

    async fn set_status(
        &self,
        conversation_id: ConversationId,
        status: ConversationStatus,
        now: Timestamp,
    ) -> RepositoryResult<Option<Conversation>> {
        let updated = sqlx::query("UPDATE conversations SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(Uuid::from(conversation_id))
            .bind(status.as_str())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.load(Uuid::from(conversation_id)).await
    }

    async fn mark_inconsistent(&self, conversation_id: ConversationId) -> RepositoryResult<()> {
        sqlx::query("UPDATE conversations SET needs_reconcile = TRUE WHERE id = $1")
            .bind(Uuid::from(conversation_id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn list_inconsistent(&self, limit: u32) -> RepositoryResult<Vec<ConversationId>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM conversations WHERE needs_reconcile ORDER BY updated_at LIMIT $1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(ids.into_iter().map(ConversationId::from).collect())
    }

    async fn reconcile(&self, conversation_id: ConversationId) -> RepositoryResult<()> {
        let id = Uuid::from(conversation_id);
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let latest = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages m
            WHERE m.conversation_id = $1 AND NOT m.is_spam
            ORDER BY m.created_at DESC, m.id DESC
            LIMIT 1
            "#
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        let last = latest
            .map(|record| MessageAggregate::for_message(&record.into_message(Vec::new())).last_message);

        let updated = sqlx::query(
            r#"
            UPDATE conversations
            SET last_message_preview = $2,
                last_message_sender_id = $3,
                last_message_at = $4,
                updated_at = GREATEST(updated_at, COALESCE($4, updated_at)),
                needs_reconcile = FALSE
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(last.as_ref().map(|l| l.content_preview.as_str()))
        .bind(last.as_ref().map(|l| Uuid::from(l.sender_id)))
        .bind(last.as_ref().map(|l| l.timestamp))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        sqlx::query(
            r#"
            UPDATE conversation_participants p
            SET unread_count = (
                SELECT COUNT(*)
                FROM messages m
                WHERE m.conversation_id = p.conversation_id
                  AND m.sender_id <> p.user_id
                  AND NOT m.is_spam
                  AND NOT m.is_deleted
                  AND (p.last_read_at IS NULL OR m.created_at > p.last_read_at)
            )
            WHERE p.conversation_id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn co_participants(&self, user_id: UserId) -> RepositoryResult<Vec<UserId>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT other.user_id
            FROM conversation_participants me
            JOIN conversations c ON c.id = me.conversation_id AND c.status <> 'deleted'
            JOIN conversation_participants other
              ON other.conversation_id = me.conversation_id AND other.user_id <> me.user_id
            WHERE me.user_id = $1
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(ids.into_iter().map(UserId::from).collect())
    }

    async fn admin_list(
        &self,
        filter: &AdminConversationFilter,
        offset: u64,
        limit: u32,
    ) -> RepositoryResult<(Vec<Conversation>, u64)> {
        let search = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")));
        let status = filter.status.map(|s| s.as_str());

        const MATCHES: &str = r#"
            ($1::text IS NULL OR c.status = $1)
            AND ($2::text IS NULL
                 OR c.context_title ILIKE $2
                 OR c.last_message_preview ILIKE $2
                 OR EXISTS (
                     SELECT 1 FROM conversation_participants p
                     WHERE p.conversation_id = c.id AND p.display_name ILIKE $2
                 ))
        "#;

        let total = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM conversations c WHERE {MATCHES}"
        ))
        .bind(status)
        .bind(search.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let records = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE {MATCHES} \
             ORDER BY c.updated_at DESC, c.id DESC OFFSET $3 LIMIT $4"
        ))
        .bind(status)
        .bind(search.as_deref())
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let conversations = self.hydrate(records).await?;
        Ok((conversations, u64::try_from(total).unwrap_or(0)))
    }

    async fn unread_summary(&self, user_id: UserId) -> RepositoryResult<UnreadSummary> {
        let record = sqlx::query_as::<_, UnreadSummaryRecord>(
            r#"
            SELECT COALESCE(SUM(p.unread_count), 0)::BIGINT AS total_unread,
                   COUNT(*) FILTER (WHERE p.unread_count > 0) AS conversations_with_unread
            FROM conversation_participants p
            JOIN conversations c ON c.id = p.conversation_id AND c.status <> 'deleted'
            WHERE p.user_id = $1
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(UnreadSummary {
            total_unread: u64::try_from(record.total_unread).unwrap_or(0),
            conversations_with_unread: u64::try_from(record.conversations_with_unread)
                .unwrap_or(0),
        })
    }
}
