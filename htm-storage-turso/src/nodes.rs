//! Node CRUD and the search primitives.
//!
//! Search follows a fetch-then-rank shape: SQL narrows to active candidate
//! rows (FTS5 for full-text), then scoring and the time/metadata filters
//! run in Rust so every backend ranks identically.

use crate::{from_micros, fts, micros, opt_from_micros, storage_err, TursoStore};
use chrono::Utc;
use htm_core::search::{cosine_similarity, trigram_similarity};
use htm_core::{ActiveFilter, Error, Metadata, NewNode, Node, NodeQuery, Result, SearchHit};
use libsql::{params, Row};

pub(crate) const NODE_COLUMNS: &str = "id, content, content_hash, token_count, embedding, \
     embedding_dimension, source_id, chunk_position, metadata, created_at, \
     updated_at, last_accessed, access_count, deleted_at";

/// The node column list with every column qualified by a table alias.
pub(crate) fn qualified_node_columns(alias: &str) -> String {
    NODE_COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn filter_clause(filter: ActiveFilter) -> &'static str {
    match filter {
        ActiveFilter::Active => "deleted_at IS NULL",
        ActiveFilter::Deleted => "deleted_at IS NOT NULL",
        ActiveFilter::All => "1=1",
    }
}

pub(crate) fn row_to_node(row: &Row) -> Result<Node> {
    let embedding_json: Option<String> = row.get(4).map_err(|e| storage_err("embedding", e))?;
    let embedding = embedding_json
        .map(|json| serde_json::from_str::<Vec<f32>>(&json))
        .transpose()
        .map_err(|e| storage_err("embedding json", e))?;
    let metadata_json: String = row.get(8).map_err(|e| storage_err("metadata", e))?;
    let metadata: Metadata =
        serde_json::from_str(&metadata_json).map_err(|e| storage_err("metadata json", e))?;

    Ok(Node {
        id: row.get(0).map_err(|e| storage_err("id", e))?,
        content: row.get(1).map_err(|e| storage_err("content", e))?,
        content_hash: row.get(2).map_err(|e| storage_err("content_hash", e))?,
        token_count: row.get::<i64>(3).map_err(|e| storage_err("token_count", e))? as usize,
        embedding,
        embedding_dimension: row
            .get::<Option<i64>>(5)
            .map_err(|e| storage_err("embedding_dimension", e))?
            .map(|d| d as usize),
        source_id: row.get(6).map_err(|e| storage_err("source_id", e))?,
        chunk_position: row
            .get::<Option<i64>>(7)
            .map_err(|e| storage_err("chunk_position", e))?
            .map(|p| p as usize),
        metadata,
        created_at: from_micros(row.get(9).map_err(|e| storage_err("created_at", e))?)?,
        updated_at: from_micros(row.get(10).map_err(|e| storage_err("updated_at", e))?)?,
        last_accessed: opt_from_micros(
            row.get(11).map_err(|e| storage_err("last_accessed", e))?,
        )?,
        access_count: row
            .get::<i64>(12)
            .map_err(|e| storage_err("access_count", e))? as u64,
        deleted_at: opt_from_micros(row.get(13).map_err(|e| storage_err("deleted_at", e))?)?,
    })
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

impl TursoStore {
    pub(crate) async fn insert_node(&self, new: NewNode) -> Result<Node> {
        let conn = self.connect()?;
        let now = micros(Utc::now());
        let metadata_json = serde_json::to_string(&new.metadata)?;

        let insert = r#"
            INSERT INTO nodes (content, content_hash, token_count, source_id,
                               chunk_position, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#;
        if let Err(e) = conn
            .execute(
                insert,
                params![
                    new.content.clone(),
                    new.content_hash.clone(),
                    new.token_count as i64,
                    new.source_id,
                    new.chunk_position.map(|p| p as i64),
                    metadata_json,
                    now,
                    now,
                ],
            )
            .await
        {
            if is_unique_violation(&e) {
                return Err(Error::DuplicateContent(new.content_hash));
            }
            return Err(storage_err("Failed to insert node", e));
        }

        let node_id = conn.last_insert_rowid();
        self.node_by_id(node_id, ActiveFilter::Active)
            .await?
            .ok_or_else(|| Error::Storage("inserted node not readable".into()))
    }

    pub(crate) async fn node_by_id(&self, id: i64, filter: ActiveFilter) -> Result<Option<Node>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE id = ? AND {}",
            filter_clause(filter)
        );
        let mut rows = conn
            .query(&sql, params![id])
            .await
            .map_err(|e| storage_err("Failed to query node", e))?;
        match rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch node row", e))?
        {
            Some(row) => Ok(Some(row_to_node(&row)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn node_by_hash(
        &self,
        hash: &str,
        filter: ActiveFilter,
    ) -> Result<Option<Node>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE content_hash = ? AND {} \
             ORDER BY id DESC LIMIT 1",
            filter_clause(filter)
        );
        let mut rows = conn
            .query(&sql, params![hash])
            .await
            .map_err(|e| storage_err("Failed to query node by hash", e))?;
        match rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch node row", e))?
        {
            Some(row) => Ok(Some(row_to_node(&row)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn set_embedding(
        &self,
        node_id: i64,
        padded: Vec<f32>,
        dimension: usize,
    ) -> Result<()> {
        let conn = self.connect()?;
        let embedding_json =
            serde_json::to_string(&padded).map_err(|e| storage_err("embedding json", e))?;
        let affected = conn
            .execute(
                "UPDATE nodes SET embedding = ?, embedding_dimension = ?, updated_at = ? \
                 WHERE id = ?",
                params![embedding_json, dimension as i64, micros(Utc::now()), node_id],
            )
            .await
            .map_err(|e| storage_err("Failed to store embedding", e))?;
        if affected == 0 {
            return Err(Error::node_not_found(node_id));
        }
        Ok(())
    }

    pub(crate) async fn soft_delete_node(&self, id: i64) -> Result<()> {
        let conn = self.connect()?;
        let now = micros(Utc::now());
        let affected = conn
            .execute(
                "UPDATE nodes SET deleted_at = ?, updated_at = ? WHERE id = ?",
                params![now, now, id],
            )
            .await
            .map_err(|e| storage_err("Failed to soft-delete node", e))?;
        if affected == 0 {
            return Err(Error::node_not_found(id));
        }
        Ok(())
    }

    pub(crate) async fn restore_node(&self, id: i64) -> Result<Node> {
        let conn = self.connect()?;

        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM nodes \
                 WHERE content_hash = (SELECT content_hash FROM nodes WHERE id = ?) \
                   AND deleted_at IS NULL AND id != ?",
                params![id, id],
            )
            .await
            .map_err(|e| storage_err("Failed to check restore collision", e))?;
        if let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch collision count", e))?
        {
            let collisions: i64 = row.get(0).map_err(|e| storage_err("count", e))?;
            if collisions > 0 {
                let node = self
                    .node_by_id(id, ActiveFilter::All)
                    .await?
                    .ok_or_else(|| Error::node_not_found(id))?;
                return Err(Error::DuplicateContent(node.content_hash));
            }
        }

        let affected = conn
            .execute(
                "UPDATE nodes SET deleted_at = NULL, updated_at = ? WHERE id = ?",
                params![micros(Utc::now()), id],
            )
            .await
            .map_err(|e| storage_err("Failed to restore node", e))?;
        if affected == 0 {
            return Err(Error::node_not_found(id));
        }
        self.node_by_id(id, ActiveFilter::Active)
            .await?
            .ok_or_else(|| Error::node_not_found(id))
    }

    pub(crate) async fn purge_node(&self, id: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM node_tags WHERE node_id = ?", params![id])
            .await
            .map_err(|e| storage_err("Failed to purge node tags", e))?;
        conn.execute("DELETE FROM robot_nodes WHERE node_id = ?", params![id])
            .await
            .map_err(|e| storage_err("Failed to purge robot nodes", e))?;
        let affected = conn
            .execute("DELETE FROM nodes WHERE id = ?", params![id])
            .await
            .map_err(|e| storage_err("Failed to purge node", e))?;
        if affected == 0 {
            return Err(Error::node_not_found(id));
        }
        Ok(())
    }

    pub(crate) async fn record_access(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.connect()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE nodes SET access_count = access_count + 1, last_accessed = ? \
             WHERE id IN ({placeholders})"
        );
        let mut values: Vec<libsql::Value> = vec![micros(Utc::now()).into()];
        values.extend(ids.iter().map(|id| libsql::Value::from(*id)));
        conn.execute(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| storage_err("Failed to record access", e))?;
        Ok(())
    }

    pub(crate) async fn count_nodes(&self, filter: ActiveFilter) -> Result<usize> {
        let conn = self.connect()?;
        let sql = format!("SELECT COUNT(*) FROM nodes WHERE {}", filter_clause(filter));
        let mut rows = conn
            .query(&sql, ())
            .await
            .map_err(|e| storage_err("Failed to count nodes", e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch count", e))?
            .ok_or_else(|| Error::Storage("count query returned no rows".into()))?;
        let count: i64 = row.get(0).map_err(|e| storage_err("count", e))?;
        Ok(count as usize)
    }

    // ========================================================================
    // Search primitives
    // ========================================================================

    pub(crate) async fn vector_search(
        &self,
        query: &NodeQuery,
        embedding: &[f32],
    ) -> Result<Vec<SearchHit>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes \
             WHERE deleted_at IS NULL AND embedding IS NOT NULL"
        );
        let mut rows = conn
            .query(&sql, ())
            .await
            .map_err(|e| storage_err("Failed to query embedded nodes", e))?;

        let mut hits = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch node row", e))?
        {
            let node = row_to_node(&row)?;
            if !query.matches_time(node.created_at) || !query.matches_metadata(&node.metadata) {
                continue;
            }
            let Some(stored) = node.embedding.as_ref() else {
                continue;
            };
            let score = cosine_similarity(stored, embedding);
            if score > 0.0 && score >= query.min_similarity {
                hits.push(SearchHit::new(node, score));
            }
        }
        sort_and_truncate(&mut hits, query.limit);
        Ok(hits)
    }

    pub(crate) async fn fulltext_search(
        &self,
        query: &NodeQuery,
        text: &str,
    ) -> Result<Vec<SearchHit>> {
        let Some(match_expr) = fts::match_expression(text) else {
            return Ok(Vec::new());
        };
        let conn = self.connect()?;
        // Over-fetch so the Rust-side time/metadata filters still leave a
        // full page of results.
        let fetch_limit = (query.limit.max(1) * 4) as i64;
        let sql = format!(
            "SELECT {}, bm25(nodes_fts) AS rank \
             FROM nodes_fts \
             JOIN nodes ON nodes.id = nodes_fts.node_id \
             WHERE nodes_fts MATCH ? AND nodes.deleted_at IS NULL \
             ORDER BY rank \
             LIMIT ?",
            qualified_node_columns("nodes")
        );
        let mut rows = conn
            .query(&sql, params![match_expr, fetch_limit])
            .await
            .map_err(|e| storage_err("Failed to run full-text search", e))?;

        let mut hits = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch FTS row", e))?
        {
            let node = row_to_node(&row)?;
            if !query.matches_time(node.created_at) || !query.matches_metadata(&node.metadata) {
                continue;
            }
            let rank: f64 = row.get(14).map_err(|e| storage_err("rank", e))?;
            let score = fts::rank_to_score(rank);
            if score > 0.0 {
                hits.push(SearchHit::new(node, score));
            }
        }
        sort_and_truncate(&mut hits, query.limit);
        Ok(hits)
    }

    pub(crate) async fn content_similarity(
        &self,
        query: &NodeQuery,
        text: &str,
    ) -> Result<Vec<SearchHit>> {
        let conn = self.connect()?;
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE deleted_at IS NULL");
        let mut rows = conn
            .query(&sql, ())
            .await
            .map_err(|e| storage_err("Failed to query nodes", e))?;

        let mut hits = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch node row", e))?
        {
            let node = row_to_node(&row)?;
            if !query.matches_time(node.created_at) || !query.matches_metadata(&node.metadata) {
                continue;
            }
            let score = trigram_similarity(&node.content, text);
            if score > 0.0 && score >= query.min_similarity {
                hits.push(SearchHit::new(node, score));
            }
        }
        sort_and_truncate(&mut hits, query.limit);
        Ok(hits)
    }
}

fn sort_and_truncate(hits: &mut Vec<SearchHit>, limit: usize) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.node.created_at.cmp(&a.node.created_at))
    });
    hits.truncate(limit);
}
