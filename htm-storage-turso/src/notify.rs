//! Durable pub/sub over a notifications table.
//!
//! libSQL has no server-push notification primitive, so channels are a
//! sequence-ordered table: publishers insert, subscribers poll past their
//! high-water mark. Ordering per channel follows the autoincrement id, and
//! any process sharing the database file observes the same sequence.

use crate::{micros, storage_err, TursoStore};
use chrono::Utc;
use htm_core::store::NotificationStream;
use htm_core::{Error, Result};
use libsql::params;
use tracing::{debug, warn};

/// Buffered payloads per subscription before backpressure.
const SUBSCRIBER_BUFFER: usize = 256;

impl TursoStore {
    pub(crate) async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO notifications (channel, payload, created_at) VALUES (?, ?, ?)",
            params![channel, payload, micros(Utc::now())],
        )
        .await
        .map_err(|e| storage_err("Failed to publish notification", e))?;
        Ok(())
    }

    pub(crate) async fn subscribe(&self, channel: &str) -> Result<NotificationStream> {
        let conn = self.connect()?;

        // Start past everything already published: a subscription only
        // sees payloads that arrive after it.
        let mut rows = conn
            .query(
                "SELECT COALESCE(MAX(id), 0) FROM notifications WHERE channel = ?",
                params![channel],
            )
            .await
            .map_err(|e| storage_err("Failed to read channel high-water mark", e))?;
        let mut high_water: i64 = match rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch high-water mark", e))?
        {
            Some(row) => row.get(0).map_err(|e| storage_err("max id", e))?,
            None => 0,
        };

        let (tx, rx) = tokio::sync::mpsc::channel(SUBSCRIBER_BUFFER);
        let db = self.database();
        let channel = channel.to_string();
        let poll_interval = self.config().notification_poll_interval;

        tokio::spawn(async move {
            loop {
                let conn = match db.connect() {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "subscription lost its connection");
                        break;
                    }
                };
                let batch = match fetch_after(&conn, &channel, high_water).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "subscription poll failed");
                        break;
                    }
                };
                for (id, payload) in batch {
                    high_water = id;
                    if tx.send(payload).await.is_err() {
                        debug!(channel = %channel, "subscriber dropped, ending poll loop");
                        return;
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
            // Exiting on error closes the stream; the subscriber is
            // expected to resynchronize and resubscribe.
        });

        Ok(NotificationStream::new(rx))
    }
}

async fn fetch_after(
    conn: &libsql::Connection,
    channel: &str,
    after: i64,
) -> Result<Vec<(i64, String)>> {
    let mut rows = conn
        .query(
            "SELECT id, payload FROM notifications \
             WHERE channel = ? AND id > ? ORDER BY id",
            params![channel, after],
        )
        .await
        .map_err(|e| storage_err("Failed to poll notifications", e))?;

    let mut batch = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| Error::Storage(format!("Failed to fetch notification row: {e}")))?
    {
        let id: i64 = row.get(0).map_err(|e| storage_err("id", e))?;
        let payload: String = row.get(1).map_err(|e| storage_err("payload", e))?;
        batch.push((id, payload));
    }
    Ok(batch)
}
