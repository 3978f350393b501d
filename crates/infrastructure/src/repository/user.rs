use application::UserDirectory;
use async_trait::async_trait;
use domain::{RepositoryResult, UserId, UserProfile};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::map_sqlx_err;

#[derive(Debug, FromRow)]
struct UserRecord {
    id: Uuid,
    display_name: Option<String>,
}

impl From<UserRecord> for UserProfile {
    fn from(value: UserRecord) -> Self {
        UserProfile {
            id: UserId::from(value.id),
            display_name: value.display_name,
        }
    }
}

/// 本地用户目录，显示名由身份服务的令牌同步
#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_profiles(&self, ids: &[UserId]) -> RepositoryResult<Vec<UserProfile>> {
        let ids: Vec<Uuid> = ids.iter().copied().map(Uuid::from).collect();
        let records = sqlx::query_as::<_, UserRecord>(
            "SELECT id, display_name FROM users WHERE id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(records.into_iter().map(UserProfile::from).collect())
    }

    async fn upsert(&self, profile: &UserProfile) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, display_name)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE
            SET display_name = COALESCE(EXCLUDED.display_name, users.display_name),
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::from(profile.id))
        .bind(profile.display_name.as_deref())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}
