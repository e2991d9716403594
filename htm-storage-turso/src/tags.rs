//! Tag and node-tag persistence.

use crate::nodes::{filter_clause, qualified_node_columns, row_to_node};
use crate::{from_micros, micros, opt_from_micros, storage_err, TursoStore};
use chrono::Utc;
use htm_core::search::trigram_similarity;
use htm_core::{ActiveFilter, Error, Node, Result, Tag, TagMatch};
use libsql::{params, Row};

const TAG_COLUMNS: &str = "id, name, created_at, deleted_at";

fn row_to_tag(row: &Row) -> Result<Tag> {
    Ok(Tag {
        id: row.get(0).map_err(|e| storage_err("id", e))?,
        name: row.get(1).map_err(|e| storage_err("name", e))?,
        created_at: from_micros(row.get(2).map_err(|e| storage_err("created_at", e))?)?,
        deleted_at: opt_from_micros(row.get(3).map_err(|e| storage_err("deleted_at", e))?)?,
    })
}

impl TursoStore {
    pub(crate) async fn upsert_tag(&self, name: &str) -> Result<Tag> {
        let conn = self.connect()?;
        // Revive a soft-deleted row with this name rather than duplicating
        let revived = conn
            .execute(
                "UPDATE tags SET deleted_at = NULL WHERE name = ?",
                params![name],
            )
            .await
            .map_err(|e| storage_err("Failed to revive tag", e))?;
        if revived == 0 {
            conn.execute(
                "INSERT INTO tags (name, created_at) VALUES (?, ?)",
                params![name, micros(Utc::now())],
            )
            .await
            .map_err(|e| storage_err("Failed to insert tag", e))?;
        }
        self.tag_by_name(name, ActiveFilter::Active)
            .await?
            .ok_or_else(|| Error::Storage(format!("upserted tag {name:?} not readable")))
    }

    pub(crate) async fn tag_by_name(
        &self,
        name: &str,
        filter: ActiveFilter,
    ) -> Result<Option<Tag>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {TAG_COLUMNS} FROM tags WHERE name = ? AND {}",
            filter_clause(filter)
        );
        let mut rows = conn
            .query(&sql, params![name])
            .await
            .map_err(|e| storage_err("Failed to query tag", e))?;
        match rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch tag row", e))?
        {
            Some(row) => Ok(Some(row_to_tag(&row)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn tags_with_counts(&self) -> Result<Vec<(Tag, u64)>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {TAG_COLUMNS}, \
                (SELECT COUNT(*) FROM node_tags nt \
                 JOIN nodes n ON n.id = nt.node_id \
                 WHERE nt.tag_id = tags.id \
                   AND nt.deleted_at IS NULL AND n.deleted_at IS NULL) AS usage_count \
             FROM tags WHERE deleted_at IS NULL \
             ORDER BY created_at DESC, id DESC"
        );
        let mut rows = conn
            .query(&sql, ())
            .await
            .map_err(|e| storage_err("Failed to query tags", e))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch tag row", e))?
        {
            let tag = row_to_tag(&row)?;
            let count: i64 = row.get(4).map_err(|e| storage_err("usage_count", e))?;
            out.push((tag, count as u64));
        }
        Ok(out)
    }

    pub(crate) async fn reap_orphan_tags(&self) -> Result<usize> {
        let conn = self.connect()?;
        let affected = conn
            .execute(
                "UPDATE tags SET deleted_at = ? \
                 WHERE deleted_at IS NULL AND id NOT IN ( \
                     SELECT nt.tag_id FROM node_tags nt \
                     JOIN nodes n ON n.id = nt.node_id \
                     WHERE nt.deleted_at IS NULL AND n.deleted_at IS NULL)",
                params![micros(Utc::now())],
            )
            .await
            .map_err(|e| storage_err("Failed to reap orphan tags", e))?;
        Ok(affected as usize)
    }

    pub(crate) async fn attach_tag(&self, node_id: i64, tag_id: i64) -> Result<bool> {
        let conn = self.connect()?;
        let mut rows = conn
            .query(
                "SELECT id, deleted_at FROM node_tags WHERE node_id = ? AND tag_id = ? \
                 ORDER BY id DESC LIMIT 1",
                params![node_id, tag_id],
            )
            .await
            .map_err(|e| storage_err("Failed to query node tag", e))?;

        if let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch node tag", e))?
        {
            let deleted: Option<i64> = row.get(1).map_err(|e| storage_err("deleted_at", e))?;
            if deleted.is_none() {
                return Ok(false);
            }
            let id: i64 = row.get(0).map_err(|e| storage_err("id", e))?;
            conn.execute(
                "UPDATE node_tags SET deleted_at = NULL WHERE id = ?",
                params![id],
            )
            .await
            .map_err(|e| storage_err("Failed to revive node tag", e))?;
            return Ok(true);
        }

        conn.execute(
            "INSERT INTO node_tags (node_id, tag_id, created_at) VALUES (?, ?, ?)",
            params![node_id, tag_id, micros(Utc::now())],
        )
        .await
        .map_err(|e| storage_err("Failed to attach tag", e))?;
        Ok(true)
    }

    pub(crate) async fn tags_for_node(&self, node_id: i64) -> Result<Vec<Tag>> {
        let conn = self.connect()?;
        let sql = "SELECT t.id, t.name, t.created_at, t.deleted_at FROM tags t \
             JOIN node_tags nt ON nt.tag_id = t.id \
             WHERE nt.node_id = ? AND nt.deleted_at IS NULL AND t.deleted_at IS NULL \
             ORDER BY t.name"
            .to_string();
        let mut rows = conn
            .query(&sql, params![node_id])
            .await
            .map_err(|e| storage_err("Failed to query node tags", e))?;

        let mut tags = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch tag row", e))?
        {
            tags.push(row_to_tag(&row)?);
        }
        Ok(tags)
    }

    pub(crate) async fn nodes_for_tag_ids(
        &self,
        tag_ids: &[i64],
        limit: usize,
    ) -> Result<Vec<Node>> {
        if tag_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect()?;
        let placeholders = vec!["?"; tag_ids.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT {} FROM nodes \
             JOIN node_tags nt ON nt.node_id = nodes.id \
             WHERE nt.tag_id IN ({placeholders}) \
               AND nt.deleted_at IS NULL AND nodes.deleted_at IS NULL \
             ORDER BY nodes.created_at DESC, nodes.id DESC \
             LIMIT ?",
            qualified_node_columns("nodes")
        );
        let mut values: Vec<libsql::Value> =
            tag_ids.iter().map(|id| libsql::Value::from(*id)).collect();
        values.push((limit as i64).into());

        let mut rows = conn
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| storage_err("Failed to query nodes by tag", e))?;

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

    pub(crate) async fn tags_by_similarity(
        &self,
        text: &str,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<TagMatch>> {
        let conn = self.connect()?;
        let sql = format!("SELECT {TAG_COLUMNS} FROM tags WHERE deleted_at IS NULL");
        let mut rows = conn
            .query(&sql, ())
            .await
            .map_err(|e| storage_err("Failed to query tags", e))?;

        let mut matches = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch tag row", e))?
        {
            let tag = row_to_tag(&row)?;
            let similarity = trigram_similarity(&tag.name, text);
            if similarity > 0.0 && similarity >= min_similarity {
                matches.push(TagMatch { tag, similarity });
            }
        }
        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(limit);
        Ok(matches)
    }
}
