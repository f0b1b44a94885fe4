use crate::bytestore::ByteStore;
use crate::error::Result;
use crate::mimetype;
use crate::model::{
    split_logical_path, File, Project, TransferRequest, DIRECTORY_MIME,
    REQUEST_FILE_STATE_DONE, REQUEST_FILE_STATE_UPLOADING,
};
use crate::store::tx::with_tx_retry;
use sqlx::MySqlPool;
use std::collections::HashSet;
use uuid::Uuid;

/// One row of a directory listing. Listings deliberately carry only the name
/// and kind so that directories with many files are not re-hydrated row by
/// row; the caller composes paths from the directory it already holds.
#[derive(Debug, Clone)]
pub struct DirListEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Typed queries and updates for file metadata. Every multi-row mutation
/// commits as a single retried transaction.
#[derive(Debug, Clone)]
pub struct FileStore {
    pool: MySqlPool,
    byte_store: ByteStore,
    tx_retry: usize,
}

impl FileStore {
    pub fn new(pool: MySqlPool, byte_store: ByteStore, tx_retry: usize) -> FileStore {
        FileStore {
            pool,
            byte_store,
            tx_retry,
        }
    }

    pub async fn get_file_by_id(&self, id: i64) -> Result<Option<File>> {
        let file = sqlx::query_as::<_, File>("SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(file)
    }

    /// The (project, path) tuple uniquely identifies a directory.
    pub async fn find_dir_by_path(&self, project_id: i64, path: &str) -> Result<Option<File>> {
        let dir = sqlx::query_as::<_, File>(
            "SELECT * FROM files WHERE project_id = ? AND path = ? AND mime_type = ?",
        )
        .bind(project_id)
        .bind(path)
        .bind(DIRECTORY_MIME)
        .fetch_optional(&self.pool)
        .await?;
        Ok(dir)
    }

    /// Union of the canonical listing (current rows in the directory) and the
    /// request's in-flight files. In-flight entries whose name collides with
    /// a canonical entry are dropped: the canonical row already names the
    /// file, the in-flight version merely shadows its bytes.
    pub async fn list_directory(
        &self,
        dir: &File,
        request: &TransferRequest,
    ) -> Result<Vec<DirListEntry>> {
        let files: Vec<(String, String)> = sqlx::query_as(
            "SELECT name, mime_type FROM files \
             WHERE directory_id = ? AND project_id = ? AND current = true",
        )
        .bind(dir.id)
        .bind(request.project_id)
        .fetch_all(&self.pool)
        .await?;

        let uploading: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM transfer_request_files \
             WHERE directory_id = ? AND transfer_request_id = ?",
        )
        .bind(dir.id)
        .bind(request.id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries: Vec<DirListEntry> = Vec::with_capacity(files.len() + uploading.len());
        let mut seen: HashSet<String> = HashSet::with_capacity(files.len());

        for (name, mime_type) in files {
            seen.insert(name.clone());
            entries.push(DirListEntry {
                name,
                is_dir: mime_type == DIRECTORY_MIME,
            });
        }

        for (name,) in uploading {
            if seen.contains(&name) {
                continue;
            }
            entries.push(DirListEntry {
                name,
                is_dir: false,
            });
        }

        Ok(entries)
    }

    /// Resolve a project-relative logical path to its metadata row. The
    /// request's in-flight version wins over the current row so that a
    /// transfer always sees the bytes it is writing.
    pub async fn get_file_by_path(
        &self,
        path: &str,
        request: &TransferRequest,
    ) -> Result<Option<File>> {
        let (dir_path, name) = split_logical_path(path);

        let Some(dir) = self.find_dir_by_path(request.project_id, &dir_path).await? else {
            return Ok(None);
        };

        let inflight = sqlx::query_as::<_, File>(
            "SELECT f.* FROM files f \
             JOIN transfer_request_files trf ON trf.file_id = f.id \
             WHERE trf.directory_id = ? AND trf.transfer_request_id = ? AND trf.name = ?",
        )
        .bind(dir.id)
        .bind(request.id)
        .bind(&name)
        .fetch_optional(&self.pool)
        .await?;

        if inflight.is_some() {
            return Ok(inflight);
        }

        let file = sqlx::query_as::<_, File>(
            "SELECT * FROM files WHERE directory_id = ? AND name = ? AND current = true",
        )
        .bind(dir.id)
        .bind(&name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(file)
    }

    /// Create the metadata for a brand new file: a non-current File row, the
    /// paired uploading TransferRequestFile, and the project's histogram and
    /// file-count bump, all in one transaction. The byte-store shard
    /// directories are materialized afterwards.
    pub async fn create_new_file(
        &self,
        name: &str,
        dir: &File,
        request: &TransferRequest,
    ) -> Result<File> {
        let mime_type = mimetype::mime_from_name(name);
        let file = self
            .add_file_to_database(name, &mime_type, request.owner_id, dir.id, request, true)
            .await?;

        self.byte_store.create_dirs(&file.uuid)?;
        Ok(file)
    }

    /// Create a new non-current version of an existing file for this
    /// transfer request, along with an empty byte-store payload so the
    /// version can be opened immediately.
    pub async fn create_new_file_version(
        &self,
        current: &File,
        request: &TransferRequest,
    ) -> Result<File> {
        let file = self
            .add_file_to_database(
                &current.name,
                &current.mime_type,
                current.owner_id,
                current.directory_id,
                request,
                false,
            )
            .await?;

        self.byte_store.create_dirs(&file.uuid)?;
        std::fs::File::create(self.byte_store.file_path(&file.uuid))?;
        Ok(file)
    }

    async fn add_file_to_database(
        &self,
        name: &str,
        mime_type: &str,
        owner_id: i64,
        dir_id: i64,
        request: &TransferRequest,
        update_project: bool,
    ) -> Result<File> {
        let file_uuid = Uuid::new_v4().to_string();
        let request_file_uuid = Uuid::new_v4().to_string();
        let description = mimetype::mime_to_description(mime_type).to_string();

        let pool = self.pool.clone();
        let name = name.to_string();
        let mime_type = mime_type.to_string();
        let project_id = request.project_id;
        let request_id = request.id;

        let file_id = with_tx_retry(self.tx_retry, || {
            let pool = pool.clone();
            let file_uuid = file_uuid.clone();
            let request_file_uuid = request_file_uuid.clone();
            let name = name.clone();
            let mime_type = mime_type.clone();
            let description = description.clone();

            async move {
                let mut tx = pool.begin().await?;

                let inserted = sqlx::query(
                    "INSERT INTO files \
                     (uuid, project_id, name, owner_id, directory_id, size, checksum, \
                      mime_type, media_type_description, current, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, 0, '', ?, '', false, NOW(), NOW())",
                )
                .bind(&file_uuid)
                .bind(project_id)
                .bind(&name)
                .bind(owner_id)
                .bind(dir_id)
                .bind(&mime_type)
                .execute(&mut *tx)
                .await?;
                let file_id = inserted.last_insert_id() as i64;

                sqlx::query(
                    "INSERT INTO transfer_request_files \
                     (uuid, project_id, owner_id, transfer_request_id, directory_id, name, \
                      file_id, state, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, NOW(), NOW())",
                )
                .bind(&request_file_uuid)
                .bind(project_id)
                .bind(owner_id)
                .bind(request_id)
                .bind(dir_id)
                .bind(&name)
                .bind(file_id)
                .bind(REQUEST_FILE_STATE_UPLOADING)
                .execute(&mut *tx)
                .await?;

                if update_project {
                    increment_project_counts(&mut tx, project_id, &description).await?;
                }

                tx.commit().await?;
                Ok(file_id)
            }
        })
        .await?;

        let file = self.get_file_by_id(file_id).await?;
        file.ok_or(crate::error::BridgeError::Db(sqlx::Error::RowNotFound))
    }

    /// Commit a released file: flip every sibling sharing (directory, name)
    /// to non-current, mark the request file done, then publish this version
    /// with its on-disk size and, when bytes were hashed, its checksum and
    /// the project's cumulative size.
    pub async fn mark_file_released(
        &self,
        file: &File,
        checksum: &str,
        project_id: i64,
        bytes_written: i64,
    ) -> Result<()> {
        let disk_size =
            tokio::fs::metadata(self.byte_store.file_path(&file.uuid)).await?.len() as i64;

        let pool = self.pool.clone();
        let checksum = checksum.to_string();
        let file_id = file.id;
        let directory_id = file.directory_id;
        let name = file.name.clone();

        with_tx_retry(self.tx_retry, || {
            let pool = pool.clone();
            let checksum = checksum.clone();
            let name = name.clone();

            async move {
                let mut tx = pool.begin().await?;

                sqlx::query(
                    "UPDATE files SET current = false WHERE directory_id = ? AND name = ?",
                )
                .bind(directory_id)
                .bind(&name)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE transfer_request_files SET state = ?, updated_at = NOW() \
                     WHERE file_id = ?",
                )
                .bind(REQUEST_FILE_STATE_DONE)
                .bind(file_id)
                .execute(&mut *tx)
                .await?;

                if checksum.is_empty() {
                    // Opened for write but never written to: publish the
                    // version without touching the checksum field.
                    sqlx::query(
                        "UPDATE files SET size = ?, current = true, updated_at = NOW() \
                         WHERE id = ?",
                    )
                    .bind(disk_size)
                    .bind(file_id)
                    .execute(&mut *tx)
                    .await?;
                } else {
                    sqlx::query(
                        "UPDATE files SET size = ?, checksum = ?, current = true, \
                         updated_at = NOW() WHERE id = ?",
                    )
                    .bind(disk_size)
                    .bind(&checksum)
                    .bind(file_id)
                    .execute(&mut *tx)
                    .await?;

                    sqlx::query(
                        "UPDATE projects SET size = size + ?, updated_at = NOW() WHERE id = ?",
                    )
                    .bind(bytes_written)
                    .bind(project_id)
                    .execute(&mut *tx)
                    .await?;
                }

                tx.commit().await?;
                Ok(())
            }
        })
        .await
    }

    /// Dedup candidate: a row in the same project with the same checksum
    /// that is not itself a dedup pointer.
    pub async fn find_by_checksum(
        &self,
        project_id: i64,
        checksum: &str,
        exclude_id: i64,
    ) -> Result<Option<File>> {
        let file = sqlx::query_as::<_, File>(
            "SELECT * FROM files WHERE project_id = ? AND checksum = ? AND id <> ? \
             AND uses_uuid IS NULL LIMIT 1",
        )
        .bind(project_id)
        .bind(checksum)
        .bind(exclude_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(file)
    }

    /// Point `file` at an existing payload with identical bytes.
    pub async fn update_file_uses(&self, file: &File, uses_uuid: &str, uses_id: i64) -> Result<()> {
        let pool = self.pool.clone();
        let uses_uuid = uses_uuid.to_string();
        let file_id = file.id;

        with_tx_retry(self.tx_retry, || {
            let pool = pool.clone();
            let uses_uuid = uses_uuid.clone();

            async move {
                sqlx::query(
                    "UPDATE files SET uses_uuid = ?, uses_id = ?, updated_at = NOW() \
                     WHERE id = ?",
                )
                .bind(&uses_uuid)
                .bind(uses_id)
                .bind(file_id)
                .execute(&pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    /// Idempotent directory creation: when a row already exists for
    /// (project, path) the existing row is returned and nothing changes.
    pub async fn create_directory(
        &self,
        parent: &File,
        path: &str,
        name: &str,
        request: &TransferRequest,
    ) -> Result<File> {
        let dir_uuid = Uuid::new_v4().to_string();

        let pool = self.pool.clone();
        let path = path.to_string();
        let name = name.to_string();
        let parent_id = parent.id;
        let project_id = request.project_id;
        let owner_id = request.owner_id;

        with_tx_retry(self.tx_retry, || {
            let pool = pool.clone();
            let dir_uuid = dir_uuid.clone();
            let path = path.clone();
            let name = name.clone();

            async move {
                let mut tx = pool.begin().await?;

                let existing = sqlx::query_as::<_, File>(
                    "SELECT * FROM files WHERE project_id = ? AND path = ?",
                )
                .bind(project_id)
                .bind(&path)
                .fetch_optional(&mut *tx)
                .await?;

                if let Some(dir) = existing {
                    tx.commit().await?;
                    return Ok(dir);
                }

                let inserted = sqlx::query(
                    "INSERT INTO files \
                     (uuid, project_id, name, owner_id, directory_id, path, size, checksum, \
                      mime_type, media_type_description, current, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, 0, '', ?, ?, true, NOW(), NOW())",
                )
                .bind(&dir_uuid)
                .bind(project_id)
                .bind(&name)
                .bind(owner_id)
                .bind(parent_id)
                .bind(&path)
                .bind(DIRECTORY_MIME)
                .bind(DIRECTORY_MIME)
                .execute(&mut *tx)
                .await?;
                let dir_id = inserted.last_insert_id() as i64;

                sqlx::query(
                    "UPDATE projects SET directory_count = directory_count + 1, \
                     updated_at = NOW() WHERE id = ?",
                )
                .bind(project_id)
                .execute(&mut *tx)
                .await?;

                let dir = sqlx::query_as::<_, File>("SELECT * FROM files WHERE id = ?")
                    .bind(dir_id)
                    .fetch_one(&mut *tx)
                    .await?;

                tx.commit().await?;
                Ok(dir)
            }
        })
        .await
    }
}

async fn increment_project_counts(
    tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
    project_id: i64,
    description: &str,
) -> Result<()> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(project_id)
        .fetch_one(&mut **tx)
        .await?;

    let mut histogram = project.file_types_histogram();
    *histogram.entry(description.to_string()).or_insert(0) += 1;
    let encoded = serde_json::to_string(&histogram)?;

    sqlx::query(
        "UPDATE projects SET file_types = ?, file_count = file_count + 1, updated_at = NOW() \
         WHERE id = ?",
    )
    .bind(encoded)
    .bind(project_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
