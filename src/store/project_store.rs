use crate::error::Result;
use crate::model::Project;
use sqlx::MySqlPool;

/// Project-level queries: listing a user's accessible projects and the team
/// membership checks that gate transfer setup.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    pool: MySqlPool,
}

impl ProjectStore {
    pub fn new(pool: MySqlPool) -> ProjectStore {
        ProjectStore { pool }
    }

    pub async fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(project)
    }

    /// Projects the user can reach through an admin or member team.
    pub async fn get_projects_for_user(&self, user_id: i64) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>(
            "SELECT * FROM projects \
             WHERE team_id IN (SELECT team_id FROM team2admin WHERE user_id = ?) \
                OR team_id IN (SELECT team_id FROM team2member WHERE user_id = ?)",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(projects)
    }

    /// Membership check used before a transfer request is created for a
    /// (user, project) pair.
    pub async fn can_access_project(&self, user_id: i64, project_id: i64) -> Result<bool> {
        let team_id: Option<(i64,)> =
            sqlx::query_as("SELECT team_id FROM projects WHERE id = ?")
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some((team_id,)) = team_id else {
            return Ok(false);
        };

        let (admins,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM team2admin WHERE team_id = ? AND user_id = ?")
                .bind(team_id)
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        if admins > 0 {
            return Ok(true);
        }

        let (members,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM team2member WHERE team_id = ? AND user_id = ?")
                .bind(team_id)
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(members > 0)
    }
}
