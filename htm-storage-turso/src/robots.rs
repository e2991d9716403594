//! Robot and robot-node persistence.

use crate::{from_micros, micros, storage_err, TursoStore};
use chrono::Utc;
use htm_core::{Error, Result, Robot, RobotNode};
use libsql::{params, Row};

fn row_to_robot(row: &Row) -> Result<Robot> {
    Ok(Robot {
        id: row.get(0).map_err(|e| storage_err("id", e))?,
        name: row.get(1).map_err(|e| storage_err("name", e))?,
        created_at: from_micros(row.get(2).map_err(|e| storage_err("created_at", e))?)?,
        last_active_at: from_micros(row.get(3).map_err(|e| storage_err("last_active_at", e))?)?,
    })
}

fn row_to_robot_node(row: &Row) -> Result<RobotNode> {
    Ok(RobotNode {
        id: row.get(0).map_err(|e| storage_err("id", e))?,
        robot_id: row.get(1).map_err(|e| storage_err("robot_id", e))?,
        node_id: row.get(2).map_err(|e| storage_err("node_id", e))?,
        first_remembered_at: from_micros(
            row.get(3).map_err(|e| storage_err("first_remembered_at", e))?,
        )?,
        last_remembered_at: from_micros(
            row.get(4).map_err(|e| storage_err("last_remembered_at", e))?,
        )?,
        remember_count: row
            .get::<i64>(5)
            .map_err(|e| storage_err("remember_count", e))? as u64,
        in_working_memory: row
            .get::<i64>(6)
            .map_err(|e| storage_err("in_working_memory", e))?
            != 0,
    })
}

impl TursoStore {
    pub(crate) async fn upsert_robot(&self, name: &str) -> Result<Robot> {
        let conn = self.connect()?;
        let now = micros(Utc::now());
        conn.execute(
            "INSERT INTO robots (name, created_at, last_active_at) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET last_active_at = excluded.last_active_at",
            params![name, now, now],
        )
        .await
        .map_err(|e| storage_err("Failed to upsert robot", e))?;

        let mut rows = conn
            .query(
                "SELECT id, name, created_at, last_active_at FROM robots WHERE name = ?",
                params![name],
            )
            .await
            .map_err(|e| storage_err("Failed to query robot", e))?;
        let row = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch robot row", e))?
            .ok_or_else(|| Error::Storage(format!("upserted robot {name:?} not readable")))?;
        row_to_robot(&row)
    }

    pub(crate) async fn record_remember(&self, robot_id: i64, node_id: i64) -> Result<RobotNode> {
        let conn = self.connect()?;
        let now = micros(Utc::now());
        conn.execute(
            "INSERT INTO robot_nodes \
                 (robot_id, node_id, first_remembered_at, last_remembered_at, \
                  remember_count, in_working_memory) \
             VALUES (?, ?, ?, ?, 1, 1) \
             ON CONFLICT(robot_id, node_id) DO UPDATE SET \
                 remember_count = remember_count + 1, \
                 last_remembered_at = excluded.last_remembered_at, \
                 in_working_memory = 1",
            params![robot_id, node_id, now, now],
        )
        .await
        .map_err(|e| storage_err("Failed to record remember", e))?;

        self.robot_node(robot_id, node_id)
            .await?
            .ok_or_else(|| Error::Storage("recorded robot_node not readable".into()))
    }

    pub(crate) async fn robot_node(
        &self,
        robot_id: i64,
        node_id: i64,
    ) -> Result<Option<RobotNode>> {
        let conn = self.connect()?;
        let mut rows = conn
            .query(
                "SELECT id, robot_id, node_id, first_remembered_at, last_remembered_at, \
                        remember_count, in_working_memory \
                 FROM robot_nodes WHERE robot_id = ? AND node_id = ?",
                params![robot_id, node_id],
            )
            .await
            .map_err(|e| storage_err("Failed to query robot node", e))?;
        match rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch robot node row", e))?
        {
            Some(row) => Ok(Some(row_to_robot_node(&row)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn set_in_working_memory(
        &self,
        robot_id: i64,
        node_id: i64,
        present: bool,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE robot_nodes SET in_working_memory = ? \
             WHERE robot_id = ? AND node_id = ?",
            params![i64::from(present), robot_id, node_id],
        )
        .await
        .map_err(|e| storage_err("Failed to update working memory flag", e))?;
        Ok(())
    }

    pub(crate) async fn working_memory_node_ids(&self, robot_ids: &[i64]) -> Result<Vec<i64>> {
        if robot_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect()?;
        let placeholders = vec!["?"; robot_ids.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT node_id FROM robot_nodes \
             WHERE in_working_memory = 1 AND robot_id IN ({placeholders}) \
             ORDER BY node_id"
        );
        let values: Vec<libsql::Value> =
            robot_ids.iter().map(|id| libsql::Value::from(*id)).collect();
        let mut rows = conn
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| storage_err("Failed to query working memory ids", e))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch id row", e))?
        {
            ids.push(row.get(0).map_err(|e| storage_err("node_id", e))?);
        }
        Ok(ids)
    }
}
