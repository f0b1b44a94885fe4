use crate::error::Result;
use crate::model::{
    split_logical_path, GlobusTransfer, TransferRequest, TransferRequestFile,
    TRANSFER_STATE_CLOSED, TRANSFER_STATE_OPEN,
};
use crate::store::tx::with_tx_retry;
use sqlx::MySqlPool;
use uuid::Uuid;

/// Queries and updates for transfer requests, their Globus sub-records, and
/// the per-request in-flight file rows.
#[derive(Debug, Clone)]
pub struct TransferStore {
    pool: MySqlPool,
    tx_retry: usize,
}

impl TransferStore {
    pub fn new(pool: MySqlPool, tx_retry: usize) -> TransferStore {
        TransferStore { pool, tx_retry }
    }

    pub async fn get_transfer_request(&self, id: i64) -> Result<Option<TransferRequest>> {
        let request =
            sqlx::query_as::<_, TransferRequest>("SELECT * FROM transfer_requests WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(request)
    }

    pub async fn create_transfer_request(
        &self,
        project_id: i64,
        owner_id: i64,
    ) -> Result<TransferRequest> {
        let request_uuid = Uuid::new_v4().to_string();

        let inserted = sqlx::query(
            "INSERT INTO transfer_requests \
             (uuid, state, project_id, owner_id, last_active_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, NOW(), NOW(), NOW())",
        )
        .bind(&request_uuid)
        .bind(TRANSFER_STATE_OPEN)
        .bind(project_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;

        let request = sqlx::query_as::<_, TransferRequest>(
            "SELECT * FROM transfer_requests WHERE id = ?",
        )
        .bind(inserted.last_insert_id() as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(request)
    }

    /// Every persisted open request with its optional Globus sub-record.
    /// Used to hydrate the transfer registry at startup so a restarted
    /// process does not re-grant ACLs.
    pub async fn list_open_transfer_requests(
        &self,
    ) -> Result<Vec<(TransferRequest, Option<GlobusTransfer>)>> {
        let requests = sqlx::query_as::<_, TransferRequest>(
            "SELECT * FROM transfer_requests WHERE state = ?",
        )
        .bind(TRANSFER_STATE_OPEN)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(requests.len());
        for request in requests {
            let globus = sqlx::query_as::<_, GlobusTransfer>(
                "SELECT * FROM globus_transfers WHERE transfer_request_id = ?",
            )
            .bind(request.id)
            .fetch_optional(&self.pool)
            .await?;
            out.push((request, globus));
        }

        Ok(out)
    }

    /// Close a request and its Globus sub-record in one retried transaction.
    pub async fn mark_transfer_request_closed(&self, request: &TransferRequest) -> Result<()> {
        let pool = self.pool.clone();
        let request_id = request.id;

        with_tx_retry(self.tx_retry, || {
            let pool = pool.clone();

            async move {
                let mut tx = pool.begin().await?;

                sqlx::query(
                    "UPDATE globus_transfers SET state = ?, updated_at = NOW() \
                     WHERE transfer_request_id = ?",
                )
                .bind(TRANSFER_STATE_CLOSED)
                .bind(request_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE transfer_requests SET state = ?, updated_at = NOW() WHERE id = ?",
                )
                .bind(TRANSFER_STATE_CLOSED)
                .bind(request_id)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok(())
            }
        })
        .await
    }

    /// Close every residual open request. Run by the supervisor at startup
    /// so that bridges killed without cleanup do not leave windows open.
    pub async fn close_all_open_requests(&self) -> Result<u64> {
        let pool = self.pool.clone();

        with_tx_retry(self.tx_retry, || {
            let pool = pool.clone();

            async move {
                let mut tx = pool.begin().await?;

                sqlx::query(
                    "UPDATE globus_transfers gt \
                     JOIN transfer_requests tr ON tr.id = gt.transfer_request_id \
                     SET gt.state = ?, gt.updated_at = NOW() WHERE tr.state = ?",
                )
                .bind(TRANSFER_STATE_CLOSED)
                .bind(TRANSFER_STATE_OPEN)
                .execute(&mut *tx)
                .await?;

                let closed = sqlx::query(
                    "UPDATE transfer_requests SET state = ?, updated_at = NOW() WHERE state = ?",
                )
                .bind(TRANSFER_STATE_CLOSED)
                .bind(TRANSFER_STATE_OPEN)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok(closed.rows_affected())
            }
        })
        .await
    }

    pub async fn delete_transfer_request(&self, request: &TransferRequest) -> Result<()> {
        sqlx::query("DELETE FROM globus_transfers WHERE transfer_request_id = ?")
            .bind(request.id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM transfer_requests WHERE id = ?")
            .bind(request.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_globus_transfer(
        &self,
        request: &TransferRequest,
        acl_id: &str,
        identity_id: &str,
    ) -> Result<GlobusTransfer> {
        let transfer_uuid = Uuid::new_v4().to_string();

        let inserted = sqlx::query(
            "INSERT INTO globus_transfers \
             (uuid, transfer_request_id, globus_acl_id, globus_identity_id, state, \
              created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, NOW(), NOW())",
        )
        .bind(&transfer_uuid)
        .bind(request.id)
        .bind(acl_id)
        .bind(identity_id)
        .bind(TRANSFER_STATE_OPEN)
        .execute(&self.pool)
        .await?;

        let globus = sqlx::query_as::<_, GlobusTransfer>(
            "SELECT * FROM globus_transfers WHERE id = ?",
        )
        .bind(inserted.last_insert_id() as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(globus)
    }

    /// Locate the in-flight file row behind a completed upload's destination
    /// path. The path is project-relative; the directory is resolved first
    /// so the (directory, name) pair can be matched.
    pub async fn get_transfer_request_file_by_path(
        &self,
        user_id: i64,
        project_id: i64,
        path: &str,
    ) -> Result<Option<TransferRequestFile>> {
        let (dir_path, name) = split_logical_path(path);

        let dir: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM files WHERE project_id = ? AND path = ? AND mime_type = 'directory'",
        )
        .bind(project_id)
        .bind(&dir_path)
        .fetch_optional(&self.pool)
        .await?;

        let Some((dir_id,)) = dir else {
            return Ok(None);
        };

        let request_file = sqlx::query_as::<_, TransferRequestFile>(
            "SELECT * FROM transfer_request_files \
             WHERE directory_id = ? AND name = ? AND project_id = ? AND owner_id = ?",
        )
        .bind(dir_id)
        .bind(&name)
        .bind(project_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(request_file)
    }

    pub async fn delete_transfer_request_file(
        &self,
        request_file: &TransferRequestFile,
    ) -> Result<()> {
        sqlx::query("DELETE FROM transfer_request_files WHERE id = ?")
            .bind(request_file.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
