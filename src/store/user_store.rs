use crate::error::Result;
use crate::model::User;
use sqlx::MySqlPool;

#[derive(Debug, Clone)]
pub struct UserStore {
    pool: MySqlPool,
}

impl UserStore {
    pub fn new(pool: MySqlPool) -> UserStore {
        UserStore { pool }
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Users who can appear under a transfer-type directory: only accounts
    /// with a configured Globus identity can be granted an ACL.
    pub async fn get_users_with_globus_account(&self) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE globus_user IS NOT NULL AND globus_user <> ''",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }
}
