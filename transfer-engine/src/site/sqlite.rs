//! SQLite-backed site: content, media, options, users and the relational store.

use super::{
    Attachment, ContentProvider, MediaDetails, MediaProvider, OptionsStore, Post, PostFields,
    RelationalStore, Row, SitePaths, User, UserStore,
};
use crate::archive::checksum::sha256_file;
use crate::database::is_valid_table_name;
use crate::{Result, TransferError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn create_pool(db_path: &Path) -> Result<DbPool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
    });
    let pool = Pool::builder().max_size(4).build(manager)?;

    // Persistent setting, only needs one connection
    let conn = pool.get()?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    Ok(pool)
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS {p}posts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  post_type TEXT NOT NULL DEFAULT 'post',
  title TEXT NOT NULL DEFAULT '',
  slug TEXT NOT NULL DEFAULT '',
  content TEXT NOT NULL DEFAULT '',
  excerpt TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL DEFAULT 'publish',
  parent_id INTEGER NOT NULL DEFAULT 0,
  menu_order INTEGER NOT NULL DEFAULT 0,
  mime_type TEXT NOT NULL DEFAULT '',
  guid TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS {p}posts_type_slug ON {p}posts(post_type, slug);

CREATE TABLE IF NOT EXISTS {p}postmeta (
  meta_id INTEGER PRIMARY KEY AUTOINCREMENT,
  post_id INTEGER NOT NULL,
  meta_key TEXT NOT NULL,
  meta_value TEXT NOT NULL DEFAULT '',
  UNIQUE(post_id, meta_key)
);

CREATE TABLE IF NOT EXISTS {p}term_relationships (
  post_id INTEGER NOT NULL,
  taxonomy TEXT NOT NULL,
  term TEXT NOT NULL,
  PRIMARY KEY (post_id, taxonomy, term)
);

CREATE TABLE IF NOT EXISTS {p}options (
  name TEXT PRIMARY KEY,
  value TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS {p}users (
  id INTEGER PRIMARY KEY,
  login TEXT NOT NULL UNIQUE,
  email TEXT NOT NULL DEFAULT '',
  display_name TEXT NOT NULL DEFAULT '',
  role TEXT NOT NULL DEFAULT 'subscriber'
);
"#;

/// Reference implementation of the content, media, options and user traits.
pub struct SqliteSite {
    pool: DbPool,
    prefix: String,
    paths: SitePaths,
    site_url: String,
}

impl SqliteSite {
    pub fn new(pool: DbPool, prefix: &str, paths: SitePaths, site_url: &str) -> Self {
        Self {
            pool,
            prefix: prefix.to_string(),
            paths,
            site_url: site_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create the site tables if they do not exist yet.
    pub fn install(&self) -> Result<()> {
        if !is_valid_table_name(&self.prefix) && !self.prefix.is_empty() {
            return Err(TransferError::Config(format!(
                "invalid table prefix '{}'",
                self.prefix
            )));
        }
        let conn = self.pool.get()?;
        conn.execute_batch(&SCHEMA.replace("{p}", &self.prefix))?;
        Ok(())
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn upload_url(&self, relative: &str) -> String {
        let base = self
            .paths
            .uploads
            .strip_prefix(&self.paths.root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| "uploads".to_string());
        format!("{}/{}/{}", self.site_url, base, relative)
    }

    fn row_to_post(row: &rusqlite::Row) -> rusqlite::Result<Post> {
        Ok(Post {
            id: row.get("id")?,
            post_type: row.get("post_type")?,
            title: row.get("title")?,
            slug: row.get("slug")?,
            content: row.get("content")?,
            excerpt: row.get("excerpt")?,
            status: row.get("status")?,
            parent_id: row.get("parent_id")?,
            menu_order: row.get("menu_order")?,
            created_at: row.get("created_at")?,
        })
    }

    fn find_post_id(conn: &Connection, table: &str, post_type: &str, slug: &str) -> Result<Option<i64>> {
        if slug.is_empty() {
            return Ok(None);
        }
        let id = conn
            .query_row(
                &format!("SELECT id FROM {} WHERE post_type = ?1 AND slug = ?2 ORDER BY id LIMIT 1", table),
                params![post_type, slug],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn unique_upload_path(dir: &Path, filename: &str) -> PathBuf {
        let candidate = dir.join(filename);
        if !candidate.exists() {
            return candidate;
        }
        let (stem, ext) = match filename.rsplit_once('.') {
            Some((stem, ext)) => (stem.to_string(), format!(".{}", ext)),
            None => (filename.to_string(), String::new()),
        };
        (1..)
            .map(|n| dir.join(format!("{}-{}{}", stem, n, ext)))
            .find(|p| !p.exists())
            .unwrap_or(candidate)
    }
}

fn decode_stored(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '-' || c == '.').to_string();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

impl ContentProvider for SqliteSite {
    fn get_post_by_id(&self, id: i64) -> Result<Option<Post>> {
        let conn = self.conn()?;
        let post = conn
            .query_row(
                &format!("SELECT * FROM {} WHERE id = ?1", self.table("posts")),
                params![id],
                Self::row_to_post,
            )
            .optional()?;
        Ok(post)
    }

    fn upsert_post(&self, fields: &PostFields) -> Result<i64> {
        let conn = self.conn()?;
        let table = self.table("posts");

        let existing = match fields.id {
            Some(id) => conn
                .query_row(
                    &format!("SELECT id FROM {} WHERE id = ?1", table),
                    params![id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?,
            None => Self::find_post_id(&conn, &table, &fields.post_type, &fields.slug)?,
        };

        if let Some(id) = existing {
            conn.execute(
                &format!(
                    "UPDATE {} SET post_type = ?1, title = ?2, slug = ?3, content = ?4, excerpt = ?5,
                     status = ?6, parent_id = ?7, menu_order = ?8, updated_at = datetime('now')
                     WHERE id = ?9",
                    table
                ),
                params![
                    fields.post_type,
                    fields.title,
                    fields.slug,
                    fields.content,
                    fields.excerpt,
                    fields.status,
                    fields.parent_id,
                    fields.menu_order,
                    id
                ],
            )?;
            return Ok(id);
        }

        conn.execute(
            &format!(
                "INSERT INTO {} (id, post_type, title, slug, content, excerpt, status, parent_id, menu_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                table
            ),
            params![
                fields.id,
                fields.post_type,
                fields.title,
                fields.slug,
                fields.content,
                fields.excerpt,
                fields.status,
                fields.parent_id,
                fields.menu_order
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_meta(&self, id: i64, key: &str) -> Result<Option<Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT meta_value FROM {} WHERE post_id = ?1 AND meta_key = ?2",
                    self.table("postmeta")
                ),
                params![id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(decode_stored))
    }

    fn all_meta(&self, id: i64) -> Result<BTreeMap<String, Value>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT meta_key, meta_value FROM {} WHERE post_id = ?1",
            self.table("postmeta")
        ))?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut meta = BTreeMap::new();
        for row in rows {
            let (key, raw) = row?;
            meta.insert(key, decode_stored(raw));
        }
        Ok(meta)
    }

    fn set_meta(&self, id: i64, key: &str, value: &Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (post_id, meta_key, meta_value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(post_id, meta_key) DO UPDATE SET meta_value = excluded.meta_value",
                self.table("postmeta")
            ),
            params![id, key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    fn get_terms(&self, id: i64, taxonomy: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT term FROM {} WHERE post_id = ?1 AND taxonomy = ?2 ORDER BY term",
            self.table("term_relationships")
        ))?;
        let rows = stmt.query_map(params![id, taxonomy], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn all_terms(&self, id: i64) -> Result<BTreeMap<String, Vec<String>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT taxonomy, term FROM {} WHERE post_id = ?1 ORDER BY taxonomy, term",
            self.table("term_relationships")
        ))?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut terms: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in rows {
            let (taxonomy, term) = row?;
            terms.entry(taxonomy).or_default().push(term);
        }
        Ok(terms)
    }

    fn set_terms(&self, id: i64, taxonomy: &str, terms: &[String]) -> Result<()> {
        let mut conn = self.conn()?;
        let table = self.table("term_relationships");
        let tx = conn.transaction()?;
        tx.execute(
            &format!("DELETE FROM {} WHERE post_id = ?1 AND taxonomy = ?2", table),
            params![id, taxonomy],
        )?;
        for term in terms {
            tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (post_id, taxonomy, term) VALUES (?1, ?2, ?3)",
                    table
                ),
                params![id, taxonomy, term],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl MediaProvider for SqliteSite {
    fn get_attachment(&self, id: i64) -> Result<Option<Attachment>> {
        let Some(post) = self.get_post_by_id(id)? else {
            return Ok(None);
        };
        if post.post_type != "attachment" {
            return Ok(None);
        }

        let conn = self.conn()?;
        let (mime_type, guid): (String, String) = conn.query_row(
            &format!("SELECT mime_type, guid FROM {} WHERE id = ?1", self.table("posts")),
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        drop(conn);

        let meta = self.all_meta(id)?;
        let text = |key: &str| {
            meta.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let relative = text("_attached_file");

        Ok(Some(Attachment {
            id,
            parent_id: post.parent_id,
            filename: relative.rsplit('/').next().unwrap_or_default().to_string(),
            mime_type,
            filesize: meta.get("_filesize").and_then(|v| v.as_u64()).unwrap_or(0),
            checksum: text("_checksum"),
            source_url: guid,
            title: post.title,
            alt: text("_alt"),
            caption: post.excerpt,
            description: post.content,
            path: self.paths.uploads.join(&relative),
        }))
    }

    fn attachments_for(&self, parent_id: i64) -> Result<Vec<Attachment>> {
        let ids: Vec<i64> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT id FROM {} WHERE post_type = 'attachment' AND parent_id = ?1 ORDER BY id",
                self.table("posts")
            ))?;
            let rows = stmt.query_map(params![parent_id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut attachments = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(attachment) = self.get_attachment(id)? {
                attachments.push(attachment);
            }
        }
        Ok(attachments)
    }

    fn sideload_file(&self, path: &Path, parent_id: i64, details: &MediaDetails) -> Result<i64> {
        let now = chrono::Utc::now();
        let subdir = now.format("%Y/%m").to_string();
        let dir = self.paths.uploads.join(&subdir);
        std::fs::create_dir_all(&dir)?;

        let filename = sanitize_filename(&details.filename);
        let dest = Self::unique_upload_path(&dir, &filename);
        std::fs::copy(path, &dest)?;

        let stored_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(filename);
        let relative = format!("{}/{}", subdir, stored_name);
        let checksum = sha256_file(&dest)?;
        let filesize = std::fs::metadata(&dest)?.len();

        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (post_type, title, slug, content, excerpt, status, parent_id, mime_type, guid)
                 VALUES ('attachment', ?1, ?2, ?3, ?4, 'inherit', ?5, ?6, ?7)",
                self.table("posts")
            ),
            params![
                details.title,
                stored_name,
                details.description,
                details.caption,
                parent_id,
                details.mime_type,
                self.upload_url(&relative)
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        self.set_meta(id, "_attached_file", &Value::String(relative))?;
        self.set_meta(id, "_checksum", &Value::String(checksum))?;
        self.set_meta(id, "_filesize", &Value::from(filesize))?;
        self.set_meta(id, "_alt", &Value::String(details.alt.clone()))?;

        tracing::debug!(attachment_id = id, parent_id, "Sideloaded media file");
        Ok(id)
    }

    fn find_by_checksum(&self, checksum: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                &format!(
                    "SELECT m.post_id FROM {} m JOIN {} p ON p.id = m.post_id
                     WHERE m.meta_key = '_checksum' AND m.meta_value = ?1 AND p.post_type = 'attachment'
                     ORDER BY m.post_id LIMIT 1",
                    self.table("postmeta"),
                    self.table("posts")
                ),
                params![serde_json::to_string(checksum)?],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }
}

impl OptionsStore for SqliteSite {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE name = ?1", self.table("options")),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(decode_stored))
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (name, value) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value",
                self.table("options")
            ),
            params![key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    fn all_with_prefix(&self, prefix: &str) -> Result<BTreeMap<String, Value>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT name, value FROM {} ORDER BY name",
            self.table("options")
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut options = BTreeMap::new();
        for row in rows {
            let (name, raw) = row?;
            if name.starts_with(prefix) {
                options.insert(name, decode_stored(raw));
            }
        }
        Ok(options)
    }
}

impl UserStore for SqliteSite {
    fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                &format!(
                    "SELECT id, login, email, display_name, role FROM {} WHERE id = ?1",
                    self.table("users")
                ),
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        login: row.get(1)?,
                        email: row.get(2)?,
                        display_name: row.get(3)?,
                        role: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn upsert_user(&self, user: &User) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (id, login, email, display_name, role) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET login = excluded.login, email = excluded.email,
                 display_name = excluded.display_name, role = excluded.role",
                self.table("users")
            ),
            params![user.id, user.login, user.email, user.display_name, user.role],
        )?;
        Ok(())
    }
}

/// [`RelationalStore`] over one dedicated connection, so connection-scoped
/// pragmas such as `foreign_keys` apply to every statement that follows.
pub struct SqliteStore {
    conn: Mutex<PooledConnection<SqliteConnectionManager>>,
}

impl SqliteStore {
    pub fn new(pool: &DbPool) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(pool.get()?),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, PooledConnection<SqliteConnectionManager>>> {
        self.conn
            .lock()
            .map_err(|_| TransferError::Internal("store connection mutex poisoned".into()))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn json_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => {
            let mut wrapped = Map::new();
            wrapped.insert("$blob".to_string(), Value::String(STANDARD.encode(b)));
            Value::Object(wrapped)
        }
    }
}

fn sql_from_json(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Object(map) if map.len() == 1 => match map.get("$blob").and_then(Value::as_str) {
            Some(encoded) => match STANDARD.decode(encoded) {
                Ok(bytes) => SqlValue::Blob(bytes),
                Err(_) => SqlValue::Text(value.to_string()),
            },
            None => SqlValue::Text(value.to_string()),
        },
        other => SqlValue::Text(other.to_string()),
    }
}

impl RelationalStore for SqliteStore {
    fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Map::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                record.insert(column.clone(), json_from_sql(row.get_ref(idx)?));
            }
            out.push(record);
        }
        Ok(out)
    }

    fn execute(&self, sql: &str) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(sql, [])?)
    }

    fn bulk_insert(&self, table: &str, rows: &[Row]) -> Result<usize> {
        if !is_valid_table_name(table) {
            return Err(TransferError::PartialWrite(format!("invalid table name '{}'", table)));
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for row in rows {
            if let Some(bad) = row.keys().find(|c| !is_valid_table_name(c)) {
                return Err(TransferError::PartialWrite(format!(
                    "invalid column name '{}' in {}",
                    bad, table
                )));
            }
            let columns: Vec<String> = row.keys().map(|c| quote_ident(c)).collect();
            let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                columns.join(", "),
                placeholders.join(", ")
            );
            let values: Vec<SqlValue> = row.values().map(sql_from_json).collect();
            let mut stmt = tx.prepare_cached(&sql)?;
            inserted += stmt.execute(rusqlite::params_from_iter(values.iter()))?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn list_tables(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tables = Vec::new();
        for name in names {
            let name = name?;
            // LIKE treats '_' as a wildcard, so filter the prefix here
            if name.starts_with(prefix) {
                tables.push(name);
            }
        }
        Ok(tables)
    }

    fn create_statement(&self, table: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let sql = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(sql.flatten())
    }

    fn set_foreign_keys(&self, enabled: bool) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(if enabled {
            "PRAGMA foreign_keys = ON;"
        } else {
            "PRAGMA foreign_keys = OFF;"
        })?;
        Ok(())
    }
}
