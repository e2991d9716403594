//! File-source persistence.

use crate::nodes::{row_to_node, NODE_COLUMNS};
use crate::{from_micros, micros, storage_err, TursoStore};
use chrono::Utc;
use htm_core::{Error, FileSource, Metadata, NewFileSource, Node, Result};
use libsql::{params, Row};

const SOURCE_COLUMNS: &str = "id, path, content_hash, mtime, frontmatter, last_synced_at";

fn row_to_source(row: &Row) -> Result<FileSource> {
    let frontmatter_json: String = row.get(4).map_err(|e| storage_err("frontmatter", e))?;
    let frontmatter: Metadata =
        serde_json::from_str(&frontmatter_json).map_err(|e| storage_err("frontmatter json", e))?;
    Ok(FileSource {
        id: row.get(0).map_err(|e| storage_err("id", e))?,
        path: row.get(1).map_err(|e| storage_err("path", e))?,
        content_hash: row.get(2).map_err(|e| storage_err("content_hash", e))?,
        mtime: from_micros(row.get(3).map_err(|e| storage_err("mtime", e))?)?,
        frontmatter,
        last_synced_at: from_micros(row.get(5).map_err(|e| storage_err("last_synced_at", e))?)?,
    })
}

impl TursoStore {
    pub(crate) async fn upsert_file_source(&self, new: NewFileSource) -> Result<FileSource> {
        let conn = self.connect()?;
        let frontmatter_json = serde_json::to_string(&new.frontmatter)?;
        conn.execute(
            "INSERT INTO file_sources (path, content_hash, mtime, frontmatter, last_synced_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(path) DO UPDATE SET \
                 content_hash = excluded.content_hash, \
                 mtime = excluded.mtime, \
                 frontmatter = excluded.frontmatter, \
                 last_synced_at = excluded.last_synced_at",
            params![
                new.path.clone(),
                new.content_hash,
                micros(new.mtime),
                frontmatter_json,
                micros(Utc::now()),
            ],
        )
        .await
        .map_err(|e| storage_err("Failed to upsert file source", e))?;

        self.file_source_by_path(&new.path)
            .await?
            .ok_or_else(|| Error::Storage(format!("upserted file source {:?} not readable", new.path)))
    }

    pub(crate) async fn file_source_by_path(&self, path: &str) -> Result<Option<FileSource>> {
        let conn = self.connect()?;
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM file_sources WHERE path = ?");
        let mut rows = conn
            .query(&sql, params![path])
            .await
            .map_err(|e| storage_err("Failed to query file source", e))?;
        match rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch file source row", e))?
        {
            Some(row) => Ok(Some(row_to_source(&row)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn nodes_for_source(&self, source_id: i64) -> Result<Vec<Node>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes \
             WHERE source_id = ? AND deleted_at IS NULL \
             ORDER BY chunk_position"
        );
        let mut rows = conn
            .query(&sql, params![source_id])
            .await
            .map_err(|e| storage_err("Failed to query chunk nodes", e))?;

        let mut nodes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch node row", e))?
        {
            nodes.push(row_to_node(&row)?);
        }
        Ok(nodes)
    }

    pub(crate) async fn remove_file_source(&self, path: &str) -> Result<usize> {
        let conn = self.connect()?;
        let Some(source) = self.file_source_by_path(path).await? else {
            return Err(Error::NotFound(format!("file source {path}")));
        };

        let now = micros(Utc::now());
        let removed = conn
            .execute(
                "UPDATE nodes SET deleted_at = ?, updated_at = ? \
                 WHERE source_id = ? AND deleted_at IS NULL",
                params![now, now, source.id],
            )
            .await
            .map_err(|e| storage_err("Failed to soft-delete chunk nodes", e))?;
        conn.execute("DELETE FROM file_sources WHERE id = ?", params![source.id])
            .await
            .map_err(|e| storage_err("Failed to delete file source", e))?;
        Ok(removed as usize)
    }
}
