//! Repository boundary to persistence.
//!
//! The only module that touches SQL. Everything above consumes fully
//! materialised rows: the registry preloads accounts, channels, servers,
//! roles and permissions at startup, and the message writer task drains
//! queued message rows into batched inserts.

pub mod passwd;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub id: Uuid,
    pub name: String,
    pub topic: String,
    pub owner: Option<Uuid>,
    pub server: Option<Uuid>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ServerRow {
    pub id: Uuid,
    pub name: String,
    pub owner: Option<Uuid>,
    pub members: Vec<Uuid>,
    pub channels: Vec<Uuid>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RoleRow {
    pub id: Uuid,
    pub name: String,
    pub priority: i64,
    pub color: String,
    pub permissions: i64,
}

#[derive(Debug, Clone)]
pub struct PermissionRow {
    pub id: Uuid,
    pub name: String,
    pub bit: i64,
}

/// One chat message bound for the `messages` table.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: Uuid,
    pub account: Option<Uuid>,
    pub channel: Option<Uuid>,
    pub target_account: Option<Uuid>,
    pub nick: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS accounts (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        created INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS channels (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE COLLATE NOCASE,
        topic TEXT NOT NULL DEFAULT '',
        owner TEXT,
        server TEXT,
        created INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS channel_members (
        channel_id TEXT NOT NULL,
        account_id TEXT NOT NULL,
        PRIMARY KEY (channel_id, account_id)
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        account_id TEXT,
        channel_id TEXT,
        target_account_id TEXT,
        nick TEXT NOT NULL,
        text TEXT NOT NULL,
        sent_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_channel
        ON messages (channel_id, sent_at)",
    "CREATE TABLE IF NOT EXISTS servers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        owner TEXT,
        created INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS server_members (
        server_id TEXT NOT NULL,
        account_id TEXT NOT NULL,
        PRIMARY KEY (server_id, account_id)
    )",
    "CREATE TABLE IF NOT EXISTS server_channels (
        server_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        PRIMARY KEY (server_id, channel_id)
    )",
    "CREATE TABLE IF NOT EXISTS roles (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        color TEXT NOT NULL DEFAULT '',
        permissions INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS permissions (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        bit INTEGER NOT NULL
    )",
];

fn parse_uuid(raw: &str) -> Result<Uuid, DbError> {
    Uuid::parse_str(raw).map_err(|_| DbError::Corrupt(format!("bad uuid {raw:?}")))
}

fn parse_opt_uuid(raw: Option<String>) -> Result<Option<Uuid>, DbError> {
    raw.as_deref().map(parse_uuid).transpose()
}

fn parse_time(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

/// Handle to the SQLite store. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) and bootstrap the schema.
    pub async fn connect(path: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        // in-memory databases are per-connection; keep the pool at one
        let max = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .connect_with(options)
            .await?;

        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(Database { pool })
    }

    // --- accounts ---

    pub async fn load_all_accounts(&self) -> Result<Vec<AccountRow>, DbError> {
        let rows = sqlx::query("SELECT id, username, password_hash, created FROM accounts")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(AccountRow {
                    id: parse_uuid(&row.get::<String, _>("id"))?,
                    username: row.get("username"),
                    password_hash: row.get("password_hash"),
                    created: parse_time(row.get("created")),
                })
            })
            .collect()
    }

    pub async fn account_get_or_create(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<AccountRow, DbError> {
        if let Some(row) =
            sqlx::query("SELECT id, username, password_hash, created FROM accounts WHERE username = ?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(AccountRow {
                id: parse_uuid(&row.get::<String, _>("id"))?,
                username: row.get("username"),
                password_hash: row.get("password_hash"),
                created: parse_time(row.get("created")),
            });
        }

        let created = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO accounts (id, username, password_hash, created) VALUES (?, ?, ?, ?)")
            .bind(id.to_string())
            .bind(username)
            .bind(password_hash)
            .bind(created.timestamp())
            .execute(&self.pool)
            .await?;

        Ok(AccountRow {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created,
        })
    }

    // --- channels ---

    pub async fn load_all_channels(&self) -> Result<Vec<ChannelRow>, DbError> {
        let rows = sqlx::query("SELECT id, name, topic, owner, server, created FROM channels")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(ChannelRow {
                    id: parse_uuid(&row.get::<String, _>("id"))?,
                    name: row.get("name"),
                    topic: row.get("topic"),
                    owner: parse_opt_uuid(row.get("owner"))?,
                    server: parse_opt_uuid(row.get("server"))?,
                    created: parse_time(row.get("created")),
                })
            })
            .collect()
    }

    pub async fn load_channel_members(&self, channel_id: Uuid) -> Result<Vec<AccountRow>, DbError> {
        let rows = sqlx::query(
            "SELECT a.id, a.username, a.password_hash, a.created
             FROM accounts a
             JOIN channel_members m ON m.account_id = a.id
             WHERE m.channel_id = ?",
        )
        .bind(channel_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(AccountRow {
                    id: parse_uuid(&row.get::<String, _>("id"))?,
                    username: row.get("username"),
                    password_hash: row.get("password_hash"),
                    created: parse_time(row.get("created")),
                })
            })
            .collect()
    }

    pub async fn channel_get_or_create(
        &self,
        name: &str,
        topic: &str,
        owner: Option<Uuid>,
        server: Option<Uuid>,
    ) -> Result<ChannelRow, DbError> {
        if let Some(row) =
            sqlx::query("SELECT id, name, topic, owner, server, created FROM channels WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(ChannelRow {
                id: parse_uuid(&row.get::<String, _>("id"))?,
                name: row.get("name"),
                topic: row.get("topic"),
                owner: parse_opt_uuid(row.get("owner"))?,
                server: parse_opt_uuid(row.get("server"))?,
                created: parse_time(row.get("created")),
            });
        }

        let created = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO channels (id, name, topic, owner, server, created) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(topic)
        .bind(owner.map(|o| o.to_string()))
        .bind(server.map(|s| s.to_string()))
        .bind(created.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(ChannelRow {
            id,
            name: name.to_string(),
            topic: topic.to_string(),
            owner,
            server,
            created,
        })
    }

    // --- messages ---

    pub async fn insert_message(&self, record: &MessageRecord) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO messages (id, account_id, channel_id, target_account_id, nick, text, sent_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.account.map(|u| u.to_string()))
        .bind(record.channel.map(|u| u.to_string()))
        .bind(record.target_account.map(|u| u.to_string()))
        .bind(&record.nick)
        .bind(&record.text)
        .bind(record.sent_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Batched variant, one transaction for the whole slice.
    pub async fn insert_messages(&self, records: &[MessageRecord]) -> Result<(), DbError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO messages (id, account_id, channel_id, target_account_id, nick, text, sent_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.id.to_string())
            .bind(record.account.map(|u| u.to_string()))
            .bind(record.channel.map(|u| u.to_string()))
            .bind(record.target_account.map(|u| u.to_string()))
            .bind(&record.nick)
            .bind(&record.text)
            .bind(record.sent_at.timestamp())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Most recent channel messages, oldest first.
    pub async fn load_recent_messages(
        &self,
        channel_id: Uuid,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, DbError> {
        let rows = sqlx::query(
            "SELECT id, account_id, channel_id, target_account_id, nick, text, sent_at
             FROM messages WHERE channel_id = ?
             ORDER BY sent_at DESC LIMIT ?",
        )
        .bind(channel_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut records: Vec<MessageRecord> = rows
            .into_iter()
            .map(|row| {
                Ok(MessageRecord {
                    id: parse_uuid(&row.get::<String, _>("id"))?,
                    account: parse_opt_uuid(row.get("account_id"))?,
                    channel: parse_opt_uuid(row.get("channel_id"))?,
                    target_account: parse_opt_uuid(row.get("target_account_id"))?,
                    nick: row.get("nick"),
                    text: row.get("text"),
                    sent_at: parse_time(row.get("sent_at")),
                })
            })
            .collect::<Result<_, DbError>>()?;
        records.reverse();
        Ok(records)
    }

    // --- servers, roles, permissions ---

    pub async fn load_all_servers(&self) -> Result<Vec<ServerRow>, DbError> {
        let rows = sqlx::query("SELECT id, name, owner, created FROM servers")
            .fetch_all(&self.pool)
            .await?;
        let mut servers = Vec::with_capacity(rows.len());
        for row in rows {
            let id = parse_uuid(&row.get::<String, _>("id"))?;

            let members = sqlx::query("SELECT account_id FROM server_members WHERE server_id = ?")
                .bind(id.to_string())
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|r| parse_uuid(&r.get::<String, _>("account_id")))
                .collect::<Result<_, _>>()?;

            let channels = sqlx::query("SELECT channel_id FROM server_channels WHERE server_id = ?")
                .bind(id.to_string())
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|r| parse_uuid(&r.get::<String, _>("channel_id")))
                .collect::<Result<_, _>>()?;

            servers.push(ServerRow {
                id,
                name: row.get("name"),
                owner: parse_opt_uuid(row.get("owner"))?,
                members,
                channels,
                created: parse_time(row.get("created")),
            });
        }
        Ok(servers)
    }

    pub async fn load_all_roles(&self) -> Result<Vec<RoleRow>, DbError> {
        let rows = sqlx::query("SELECT id, name, priority, color, permissions FROM roles")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(RoleRow {
                    id: parse_uuid(&row.get::<String, _>("id"))?,
                    name: row.get("name"),
                    priority: row.get("priority"),
                    color: row.get("color"),
                    permissions: row.get("permissions"),
                })
            })
            .collect()
    }

    pub async fn load_all_permissions(&self) -> Result<Vec<PermissionRow>, DbError> {
        let rows = sqlx::query("SELECT id, name, bit FROM permissions")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(PermissionRow {
                    id: parse_uuid(&row.get::<String, _>("id"))?,
                    name: row.get("name"),
                    bit: row.get("bit"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn account_get_or_create_is_idempotent() {
        let db = Database::connect(":memory:").await.unwrap();
        let first = db.account_get_or_create("alice", "hash").await.unwrap();
        let second = db.account_get_or_create("alice", "other").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.password_hash, "hash");
        assert_eq!(db.load_all_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn channel_round_trip_with_members() {
        let db = Database::connect(":memory:").await.unwrap();
        let alice = db.account_get_or_create("alice", "h").await.unwrap();
        let chan = db
            .channel_get_or_create("general", "hello", Some(alice.id), None)
            .await
            .unwrap();

        sqlx::query("INSERT INTO channel_members (channel_id, account_id) VALUES (?, ?)")
            .bind(chan.id.to_string())
            .bind(alice.id.to_string())
            .execute(&db.pool)
            .await
            .unwrap();

        let loaded = db.load_all_channels().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].owner, Some(alice.id));

        let members = db.load_channel_members(chan.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].username, "alice");
    }

    #[tokio::test]
    async fn batched_messages_and_recent_query() {
        let db = Database::connect(":memory:").await.unwrap();
        let chan = db
            .channel_get_or_create("logs", "", None, None)
            .await
            .unwrap();

        let mk = |text: &str, secs: i64| MessageRecord {
            id: Uuid::new_v4(),
            account: None,
            channel: Some(chan.id),
            target_account: None,
            nick: "n".to_string(),
            text: text.to_string(),
            sent_at: parse_time(secs),
        };
        db.insert_messages(&[mk("one", 1), mk("two", 2), mk("three", 3)])
            .await
            .unwrap();

        let recent = db.load_recent_messages(chan.id, 2).await.unwrap();
        let texts: Vec<_> = recent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let db = Database::connect(":memory:").await.unwrap();
        db.insert_messages(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatterd.db");
        let path = path.to_str().unwrap();

        let created = {
            let db = Database::connect(path).await.unwrap();
            db.account_get_or_create("alice", "hash").await.unwrap()
        };

        let db = Database::connect(path).await.unwrap();
        let loaded = db.load_all_accounts().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, created.id);
        assert_eq!(loaded[0].username, "alice");
    }
}
