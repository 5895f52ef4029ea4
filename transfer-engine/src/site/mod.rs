//! Narrow interfaces to the hosting application.
//!
//! The engine never reaches into the content model directly: posts, media,
//! options, users and the relational store are all consumed through the
//! traits below. [`sqlite::SqliteSite`] is the reference implementation.

pub mod sqlite;

use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One row of a relational table, columns in table order.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub post_type: String,
    pub title: String,
    pub slug: String,
    pub content: String,
    pub excerpt: String,
    pub status: String,
    pub parent_id: i64,
    pub menu_order: i64,
    pub created_at: String,
}

/// Fields accepted by [`ContentProvider::upsert_post`]. Without an id the
/// post is matched on `(post_type, slug)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostFields {
    pub id: Option<i64>,
    pub post_type: String,
    pub title: String,
    pub slug: String,
    pub content: String,
    pub excerpt: String,
    pub status: String,
    pub parent_id: i64,
    pub menu_order: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub parent_id: i64,
    pub filename: String,
    pub mime_type: String,
    pub filesize: u64,
    pub checksum: String,
    pub source_url: String,
    pub title: String,
    pub alt: String,
    pub caption: String,
    pub description: String,
    /// Location of the file on disk
    pub path: PathBuf,
}

/// Descriptive fields for a sideloaded file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaDetails {
    pub filename: String,
    pub mime_type: String,
    pub title: String,
    pub alt: String,
    pub caption: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub login: String,
    pub email: String,
    pub display_name: String,
    pub role: String,
}

pub trait ContentProvider: Send + Sync {
    fn get_post_by_id(&self, id: i64) -> Result<Option<Post>>;
    fn upsert_post(&self, fields: &PostFields) -> Result<i64>;
    fn get_meta(&self, id: i64, key: &str) -> Result<Option<Value>>;
    fn all_meta(&self, id: i64) -> Result<BTreeMap<String, Value>>;
    fn set_meta(&self, id: i64, key: &str, value: &Value) -> Result<()>;
    fn get_terms(&self, id: i64, taxonomy: &str) -> Result<Vec<String>>;
    fn all_terms(&self, id: i64) -> Result<BTreeMap<String, Vec<String>>>;
    fn set_terms(&self, id: i64, taxonomy: &str, terms: &[String]) -> Result<()>;
}

pub trait MediaProvider: Send + Sync {
    fn get_attachment(&self, id: i64) -> Result<Option<Attachment>>;
    fn attachments_for(&self, parent_id: i64) -> Result<Vec<Attachment>>;
    /// Copy a file into the media library and register it.
    fn sideload_file(&self, path: &Path, parent_id: i64, details: &MediaDetails) -> Result<i64>;
    fn find_by_checksum(&self, checksum: &str) -> Result<Option<i64>>;
}

pub trait OptionsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: &Value) -> Result<()>;
    fn all_with_prefix(&self, prefix: &str) -> Result<BTreeMap<String, Value>>;
}

pub trait UserStore: Send + Sync {
    fn get_user(&self, id: i64) -> Result<Option<User>>;
    fn upsert_user(&self, user: &User) -> Result<()>;
}

/// Thin query interface over the site database.
pub trait RelationalStore: Send + Sync {
    fn query(&self, sql: &str) -> Result<Vec<Row>>;
    fn execute(&self, sql: &str) -> Result<usize>;
    fn bulk_insert(&self, table: &str, rows: &[Row]) -> Result<usize>;
    fn table_exists(&self, name: &str) -> Result<bool>;
    /// Tables whose names start with `prefix`, sorted.
    fn list_tables(&self, prefix: &str) -> Result<Vec<String>>;
    /// The CREATE statement of a table, if it exists.
    fn create_statement(&self, table: &str) -> Result<Option<String>>;
    fn set_foreign_keys(&self, enabled: bool) -> Result<()>;
}

/// Filesystem locations of a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SitePaths {
    pub root: PathBuf,
    pub content: PathBuf,
    pub uploads: PathBuf,
    pub plugins: PathBuf,
    pub mu_plugins: PathBuf,
    pub themes: PathBuf,
}

/// Identity of a site as recorded in dumps and manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteInfo {
    pub site_url: String,
    pub home_url: String,
    pub table_prefix: String,
    pub paths: SitePaths,
}

/// File groups that can travel inside a site archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    Uploads,
    Content,
    Plugins,
    MuPlugins,
    Themes,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Uploads,
        Component::Content,
        Component::Plugins,
        Component::MuPlugins,
        Component::Themes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Uploads => "uploads",
            Component::Content => "content",
            Component::Plugins => "plugins",
            Component::MuPlugins => "mu-plugins",
            Component::Themes => "themes",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Component::ALL.into_iter().find(|c| c.as_str() == name)
    }

    pub fn dir<'a>(&self, paths: &'a SitePaths) -> &'a Path {
        match self {
            Component::Uploads => &paths.uploads,
            Component::Content => &paths.content,
            Component::Plugins => &paths.plugins,
            Component::MuPlugins => &paths.mu_plugins,
            Component::Themes => &paths.themes,
        }
    }

    /// Entry prefix inside a site archive, e.g. `files/uploads/`.
    pub fn archive_prefix(&self) -> String {
        format!("files/{}/", self.as_str())
    }
}

/// Every collaborator the engine talks to, bundled for cheap cloning.
#[derive(Clone)]
pub struct Site {
    pub info: SiteInfo,
    pub content: Arc<dyn ContentProvider>,
    pub media: Arc<dyn MediaProvider>,
    pub options: Arc<dyn OptionsStore>,
    pub users: Arc<dyn UserStore>,
    pub store: Arc<dyn RelationalStore>,
}

impl Site {
    /// Open the SQLite-backed site described by `config`, creating its tables if needed.
    pub fn sqlite(config: &crate::Config) -> Result<Site> {
        let pool = sqlite::create_pool(&config.db_path())?;
        let site = Arc::new(sqlite::SqliteSite::new(
            pool.clone(),
            &config.site.table_prefix,
            config.site_paths(),
            &config.site.site_url,
        ));
        site.install()?;
        let store = Arc::new(sqlite::SqliteStore::new(&pool)?);

        Ok(Site {
            info: SiteInfo {
                site_url: config.site.site_url.clone(),
                home_url: config.home_url(),
                table_prefix: config.site.table_prefix.clone(),
                paths: config.site_paths(),
            },
            content: site.clone(),
            media: site.clone(),
            options: site.clone(),
            users: site,
            store,
        })
    }

    /// Current site/home URL, preferring the stored options over configuration.
    pub fn current_urls(&self) -> Result<(String, String)> {
        let read = |key: &str, fallback: &str| -> Result<String> {
            Ok(self
                .options
                .get(key)?
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| fallback.to_string()))
        };
        Ok((
            read("siteurl", &self.info.site_url)?,
            read("home", &self.info.home_url)?,
        ))
    }
}
