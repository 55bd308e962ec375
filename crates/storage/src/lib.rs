use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{EdgeStatus, GroupId, MessageId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub username: String,
    pub password_hash: String,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredFriendEdge {
    pub from_user: String,
    pub to_user: String,
    pub status: EdgeStatus,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub from_user: String,
    pub to_user: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub deleted: bool,
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone)]
pub struct StoredGroupMessage {
    pub id: MessageId,
    pub group_id: GroupId,
    pub from_user: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub deleted: bool,
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone)]
pub struct StoredGroup {
    pub id: GroupId,
    pub name: String,
    pub created_by: String,
    pub members: Vec<String>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS users (
                username      TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                last_seen     TEXT
            )",
            "CREATE TABLE IF NOT EXISTS friend_edges (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                from_user  TEXT NOT NULL,
                to_user    TEXT NOT NULL,
                status     TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            "CREATE TABLE IF NOT EXISTS messages (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                from_user TEXT NOT NULL,
                to_user   TEXT NOT NULL,
                text      TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                is_read   INTEGER NOT NULL DEFAULT 0,
                deleted   INTEGER NOT NULL DEFAULT 0,
                reply_to  INTEGER
            )",
            "CREATE TABLE IF NOT EXISTS chat_groups (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                name       TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            "CREATE TABLE IF NOT EXISTS group_members (
                group_id INTEGER NOT NULL,
                username TEXT NOT NULL,
                PRIMARY KEY (group_id, username)
            )",
            "CREATE TABLE IF NOT EXISTS group_messages (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id  INTEGER NOT NULL,
                from_user TEXT NOT NULL,
                text      TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                is_read   INTEGER NOT NULL DEFAULT 0,
                deleted   INTEGER NOT NULL DEFAULT 0,
                reply_to  INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (from_user, to_user)",
            "CREATE INDEX IF NOT EXISTS idx_friend_edges_to_user
                ON friend_edges (to_user, status)",
            "CREATE INDEX IF NOT EXISTS idx_group_messages_group
                ON group_messages (group_id)",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to initialize chat schema")?;
        }
        Ok(())
    }

    // --- users ---

    /// Inserts a user row; returns false if the username is already taken.
    pub async fn insert_user(&self, username: &str, password_hash: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO users (username, password_hash) VALUES (?, ?)",
        )
        .bind(username)
        .bind(password_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_user(&self, username: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT username, password_hash, last_seen FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredUser {
            username: r.get::<String, _>(0),
            password_hash: r.get::<String, _>(1),
            last_seen: r.get::<Option<DateTime<Utc>>, _>(2),
        }))
    }

    pub async fn user_exists(&self, username: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn set_last_seen(&self, username: &str, when: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET last_seen = ? WHERE username = ?")
            .bind(when)
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- friend edges ---

    pub async fn edge_between(&self, a: &str, b: &str) -> Result<Option<StoredFriendEdge>> {
        let row = sqlx::query(
            "SELECT from_user, to_user, status FROM friend_edges
             WHERE (from_user = ? AND to_user = ?) OR (from_user = ? AND to_user = ?)",
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredFriendEdge {
            from_user: r.get::<String, _>(0),
            to_user: r.get::<String, _>(1),
            status: match r.get::<String, _>(2).as_str() {
                "accepted" => EdgeStatus::Accepted,
                _ => EdgeStatus::Pending,
            },
        }))
    }

    pub async fn insert_pending_edge(&self, from_user: &str, to_user: &str) -> Result<()> {
        sqlx::query("INSERT INTO friend_edges (from_user, to_user, status) VALUES (?, ?, ?)")
            .bind(from_user)
            .bind(to_user)
            .bind("pending")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flips a pending edge to accepted; returns false when no such pending
    /// edge exists (already accepted, rejected, or never sent).
    pub async fn accept_pending_edge(&self, from_user: &str, to_user: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE friend_edges SET status = 'accepted'
             WHERE from_user = ? AND to_user = ? AND status = 'pending'",
        )
        .bind(from_user)
        .bind(to_user)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_pending_edge(&self, from_user: &str, to_user: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM friend_edges
             WHERE from_user = ? AND to_user = ? AND status = 'pending'",
        )
        .bind(from_user)
        .bind(to_user)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_accepted_edge(&self, a: &str, b: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM friend_edges
             WHERE status = 'accepted'
               AND ((from_user = ? AND to_user = ?) OR (from_user = ? AND to_user = ?))",
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn friends_of(&self, username: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT CASE WHEN from_user = ? THEN to_user ELSE from_user END AS friend
             FROM friend_edges
             WHERE status = 'accepted' AND (from_user = ? OR to_user = ?)
             ORDER BY lower(friend) ASC",
        )
        .bind(username)
        .bind(username)
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
    }

    pub async fn pending_requesters_for(&self, username: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT from_user FROM friend_edges
             WHERE to_user = ? AND status = 'pending'
             ORDER BY id ASC",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
    }

    // --- direct messages ---

    pub async fn insert_message(
        &self,
        from_user: &str,
        to_user: &str,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<StoredMessage> {
        let timestamp = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (from_user, to_user, text, timestamp, reply_to)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(from_user)
        .bind(to_user)
        .bind(text)
        .bind(timestamp)
        .bind(reply_to.map(|id| id.0))
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredMessage {
            id: MessageId(rec.get::<i64, _>(0)),
            from_user: from_user.to_string(),
            to_user: to_user.to_string(),
            text: text.to_string(),
            timestamp,
            is_read: false,
            deleted: false,
            reply_to,
        })
    }

    pub async fn conversation_between(&self, a: &str, b: &str) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, from_user, to_user, text, timestamp, is_read, deleted, reply_to
             FROM messages
             WHERE (from_user = ? AND to_user = ?) OR (from_user = ? AND to_user = ?)
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(direct_message_from_row).collect())
    }

    pub async fn get_message(&self, id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, from_user, to_user, text, timestamp, is_read, deleted, reply_to
             FROM messages WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(direct_message_from_row))
    }

    /// Marks every unread message from `from_user` to `to_user` as read.
    pub async fn mark_conversation_read(&self, from_user: &str, to_user: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET is_read = 1
             WHERE from_user = ? AND to_user = ? AND is_read = 0",
        )
        .bind(from_user)
        .bind(to_user)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn unread_count(&self, from_user: &str, to_user: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE from_user = ? AND to_user = ? AND is_read = 0",
        )
        .bind(from_user)
        .bind(to_user)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn mark_message_deleted(&self, id: MessageId) -> Result<bool> {
        let result = sqlx::query("UPDATE messages SET deleted = 1 WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn message_in_conversation(&self, id: MessageId, a: &str, b: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM messages
             WHERE id = ?
               AND ((from_user = ? AND to_user = ?) OR (from_user = ? AND to_user = ?))",
        )
        .bind(id.0)
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    // --- groups ---

    /// Creates a group with its initial member set in one transaction, so no
    /// reader can observe the group without its creator in the member list.
    pub async fn insert_group(
        &self,
        name: &str,
        created_by: &str,
        members: &[String],
    ) -> Result<GroupId> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query("INSERT INTO chat_groups (name, created_by) VALUES (?, ?) RETURNING id")
            .bind(name)
            .bind(created_by)
            .fetch_one(&mut *tx)
            .await?;
        let group_id = GroupId(rec.get::<i64, _>(0));
        for member in members {
            sqlx::query("INSERT OR IGNORE INTO group_members (group_id, username) VALUES (?, ?)")
                .bind(group_id.0)
                .bind(member)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(group_id)
    }

    pub async fn get_group(&self, id: GroupId) -> Result<Option<StoredGroup>> {
        let row = sqlx::query("SELECT id, name, created_by FROM chat_groups WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let members = self.group_members(id).await?;
        Ok(Some(StoredGroup {
            id: GroupId(row.get::<i64, _>(0)),
            name: row.get::<String, _>(1),
            created_by: row.get::<String, _>(2),
            members,
        }))
    }

    async fn group_members(&self, id: GroupId) -> Result<Vec<String>> {
        // rowid order preserves join order, creator first.
        let rows = sqlx::query(
            "SELECT username FROM group_members WHERE group_id = ? ORDER BY rowid ASC",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
    }

    pub async fn groups_for_user(&self, username: &str) -> Result<Vec<StoredGroup>> {
        let rows = sqlx::query(
            "SELECT g.id, g.name, g.created_by
             FROM chat_groups g
             INNER JOIN group_members m ON m.group_id = g.id
             WHERE m.username = ?
             ORDER BY g.id ASC",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        let mut groups = Vec::with_capacity(rows.len());
        for row in rows {
            let id = GroupId(row.get::<i64, _>(0));
            let members = self.group_members(id).await?;
            groups.push(StoredGroup {
                id,
                name: row.get::<String, _>(1),
                created_by: row.get::<String, _>(2),
                members,
            });
        }
        Ok(groups)
    }

    pub async fn add_group_member(&self, id: GroupId, username: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO group_members (group_id, username) VALUES (?, ?)",
        )
        .bind(id.0)
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn remove_group_member(&self, id: GroupId, username: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND username = ?")
            .bind(id.0)
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_group_member(&self, id: GroupId, username: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM group_members WHERE group_id = ? AND username = ?")
            .bind(id.0)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    // --- group messages ---

    pub async fn insert_group_message(
        &self,
        group_id: GroupId,
        from_user: &str,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<StoredGroupMessage> {
        let timestamp = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO group_messages (group_id, from_user, text, timestamp, reply_to)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(group_id.0)
        .bind(from_user)
        .bind(text)
        .bind(timestamp)
        .bind(reply_to.map(|id| id.0))
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredGroupMessage {
            id: MessageId(rec.get::<i64, _>(0)),
            group_id,
            from_user: from_user.to_string(),
            text: text.to_string(),
            timestamp,
            is_read: false,
            deleted: false,
            reply_to,
        })
    }

    pub async fn group_conversation(&self, group_id: GroupId) -> Result<Vec<StoredGroupMessage>> {
        let rows = sqlx::query(
            "SELECT id, group_id, from_user, text, timestamp, is_read, deleted, reply_to
             FROM group_messages
             WHERE group_id = ?
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(group_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(group_message_from_row).collect())
    }

    pub async fn get_group_message(&self, id: MessageId) -> Result<Option<StoredGroupMessage>> {
        let row = sqlx::query(
            "SELECT id, group_id, from_user, text, timestamp, is_read, deleted, reply_to
             FROM group_messages WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(group_message_from_row))
    }

    /// The group read flag is shared, not per member: a reader marks every
    /// message authored by someone else as read for the whole group.
    pub async fn mark_group_read_excluding(&self, group_id: GroupId, reader: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE group_messages SET is_read = 1
             WHERE group_id = ? AND from_user != ? AND is_read = 0",
        )
        .bind(group_id.0)
        .bind(reader)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn group_unread_count(&self, group_id: GroupId, username: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM group_messages
             WHERE group_id = ? AND from_user != ? AND is_read = 0",
        )
        .bind(group_id.0)
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn mark_group_message_deleted(&self, id: MessageId) -> Result<bool> {
        let result = sqlx::query("UPDATE group_messages SET deleted = 1 WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn group_message_in_group(&self, id: MessageId, group_id: GroupId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM group_messages WHERE id = ? AND group_id = ?")
            .bind(id.0)
            .bind(group_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn direct_message_from_row(row: sqlx::sqlite::SqliteRow) -> StoredMessage {
    StoredMessage {
        id: MessageId(row.get::<i64, _>(0)),
        from_user: row.get::<String, _>(1),
        to_user: row.get::<String, _>(2),
        text: row.get::<String, _>(3),
        timestamp: row.get::<DateTime<Utc>, _>(4),
        is_read: row.get::<bool, _>(5),
        deleted: row.get::<bool, _>(6),
        reply_to: row.get::<Option<i64>, _>(7).map(MessageId),
    }
}

fn group_message_from_row(row: sqlx::sqlite::SqliteRow) -> StoredGroupMessage {
    StoredGroupMessage {
        id: MessageId(row.get::<i64, _>(0)),
        group_id: GroupId(row.get::<i64, _>(1)),
        from_user: row.get::<String, _>(2),
        text: row.get::<String, _>(3),
        timestamp: row.get::<DateTime<Utc>, _>(4),
        is_read: row.get::<bool, _>(5),
        deleted: row.get::<bool, _>(6),
        reply_to: row.get::<Option<i64>, _>(7).map(MessageId),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
