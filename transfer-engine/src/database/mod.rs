//! Full database dump and restore through [`RelationalStore`].
//!
//! A dump captures every table under the site prefix: its CREATE statement
//! and all rows in column order. Restore recreates missing tables, truncates
//! and bulk-inserts each table in its own transaction with foreign keys off.

pub mod replay;

pub use replay::{replay_sql, ReplayReport};

use crate::site::{RelationalStore, Row, SiteInfo};
use crate::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DumpPaths {
    pub root: String,
    pub content: String,
    pub uploads: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDump {
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseDump {
    pub site_url: String,
    pub home_url: String,
    pub table_prefix: String,
    #[serde(default)]
    pub paths: DumpPaths,
    #[serde(default)]
    pub tables: BTreeMap<String, TableDump>,
}

/// Outcome of [`import`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub tables: usize,
    pub rows: usize,
    pub skipped: Vec<String>,
}

/// Table and column names allowed in generated SQL.
pub fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

pub fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Dump every table under the site's prefix.
pub fn export(store: &dyn RelationalStore, info: &SiteInfo) -> Result<DatabaseDump> {
    let names = store.list_tables(&info.table_prefix)?;
    export_tables(store, info, &names)
}

/// Dump only the tables named in `names`.
pub fn export_tables(store: &dyn RelationalStore, info: &SiteInfo, names: &[String]) -> Result<DatabaseDump> {
    let mut tables = BTreeMap::new();
    for name in names {
        let name = name.clone();
        if !is_valid_table_name(&name) {
            tracing::debug!(table = %name, "Skipping table with unsupported name");
            continue;
        }
        let schema = store.create_statement(&name)?;
        let rows = store.query(&format!("SELECT * FROM \"{}\"", name))?;
        tracing::debug!(table = %name, rows = rows.len(), "Dumped table");
        tables.insert(name, TableDump { schema, rows });
    }

    let display = |p: &std::path::Path| p.to_string_lossy().into_owned();
    Ok(DatabaseDump {
        site_url: info.site_url.clone(),
        home_url: info.home_url.clone(),
        table_prefix: info.table_prefix.clone(),
        paths: DumpPaths {
            root: display(&info.paths.root),
            content: display(&info.paths.content),
            uploads: display(&info.paths.uploads),
        },
        tables,
    })
}

/// Re-enables foreign key checks when dropped, whatever happened in between.
struct ForeignKeyGuard<'a> {
    store: &'a dyn RelationalStore,
}

impl Drop for ForeignKeyGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.set_foreign_keys(true) {
            tracing::error!(error = %e, "Failed to re-enable foreign key checks");
        }
    }
}

/// Map a dumped table name onto the target prefix.
fn target_table_name(name: &str, source_prefix: &str, target_prefix: &str) -> String {
    match name.strip_prefix(source_prefix) {
        Some(rest) if source_prefix != target_prefix => format!("{}{}", target_prefix, rest),
        _ => name.to_string(),
    }
}

fn is_create_table(schema: &str) -> bool {
    let words: Vec<String> = schema
        .split_whitespace()
        .take(2)
        .map(|w| w.to_ascii_uppercase())
        .collect();
    words == ["CREATE", "TABLE"]
}

/// Restore a dump. Tables are processed in name order; the first failing
/// truncate or insert aborts the restore with [`TransferError::PartialWrite`].
pub fn import(store: &dyn RelationalStore, dump: &DatabaseDump, target_prefix: &str) -> Result<RestoreReport> {
    store.set_foreign_keys(false)?;
    let _guard = ForeignKeyGuard { store };

    let mut report = RestoreReport::default();
    for (name, table) in &dump.tables {
        let target = target_table_name(name, &dump.table_prefix, target_prefix);
        if !is_valid_table_name(name) || !is_valid_table_name(&target) {
            tracing::debug!(table = %name, "Skipping table with invalid name");
            report.skipped.push(name.clone());
            continue;
        }

        if !store.table_exists(&target)? {
            match table.schema.as_deref() {
                Some(schema) if is_create_table(schema) => {
                    let schema = schema.replacen(name.as_str(), &target, 1);
                    store
                        .execute(&schema)
                        .map_err(|e| TransferError::PartialWrite(format!("create {}: {}", target, e)))?;
                    if !store.table_exists(&target)? {
                        return Err(TransferError::PartialWrite(format!(
                            "schema for {} did not create the table",
                            target
                        )));
                    }
                }
                Some(_) => {
                    tracing::warn!(table = %name, "Skipping table whose schema is not a CREATE TABLE statement");
                    report.skipped.push(name.clone());
                    continue;
                }
                None => {
                    tracing::debug!(table = %name, "Skipping absent table without schema");
                    report.skipped.push(name.clone());
                    continue;
                }
            }
        }

        store
            .execute(&format!("DELETE FROM \"{}\"", target))
            .map_err(|e| TransferError::PartialWrite(format!("truncate {}: {}", target, e)))?;
        let inserted = store
            .bulk_insert(&target, &table.rows)
            .map_err(|e| TransferError::PartialWrite(format!("insert into {}: {}", target, e)))?;

        tracing::debug!(table = %target, rows = inserted, "Restored table");
        report.tables += 1;
        report.rows += inserted;
    }

    Ok(report)
}

/// Replace `from` with `to` in every text column of the posts, postmeta and
/// options tables. Returns the number of rows touched.
pub fn rewrite_urls(store: &dyn RelationalStore, prefix: &str, from: &str, to: &str) -> Result<usize> {
    let from = from.trim_end_matches('/');
    let to = to.trim_end_matches('/');
    if from.is_empty() || from == to {
        return Ok(0);
    }

    let mut touched = 0;
    for suffix in ["posts", "postmeta", "options"] {
        let table = format!("{}{}", prefix, suffix);
        if !is_valid_table_name(&table) || !store.table_exists(&table)? {
            continue;
        }

        let columns: Vec<String> = store
            .query(&format!("PRAGMA table_info(\"{}\")", table))?
            .into_iter()
            .filter(|col| {
                col.get("type")
                    .and_then(|t| t.as_str())
                    .map(|t| t.to_ascii_uppercase().contains("TEXT"))
                    .unwrap_or(false)
            })
            .filter_map(|col| col.get("name").and_then(|n| n.as_str()).map(str::to_string))
            .filter(|name| is_valid_table_name(name))
            .collect();

        for column in columns {
            touched += store.execute(&format!(
                "UPDATE \"{table}\" SET \"{column}\" = REPLACE(\"{column}\", {from}, {to}) \
                 WHERE \"{column}\" LIKE {pattern}",
                table = table,
                column = column,
                from = sql_quote(from),
                to = sql_quote(to),
                pattern = sql_quote(&format!("%{}%", from)),
            ))?;
        }
    }

    tracing::info!(from, to, rows = touched, "Rewrote site URLs");
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::sqlite::{create_pool, SqliteStore};
    use crate::site::SitePaths;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SqliteStore {
        let pool = create_pool(&dir.path().join("db.sqlite")).unwrap();
        SqliteStore::new(&pool).unwrap()
    }

    fn info(prefix: &str) -> SiteInfo {
        SiteInfo {
            site_url: "https://old.test".into(),
            home_url: "https://old.test".into(),
            table_prefix: prefix.into(),
            paths: SitePaths {
                root: PathBuf::from("/srv"),
                content: PathBuf::from("/srv/content"),
                uploads: PathBuf::from("/srv/content/uploads"),
                plugins: PathBuf::from("/srv/content/plugins"),
                mu_plugins: PathBuf::from("/srv/content/mu-plugins"),
                themes: PathBuf::from("/srv/content/themes"),
            },
        }
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_table_name_validation() {
        assert!(is_valid_table_name("wp_posts"));
        assert!(!is_valid_table_name("wp_posts; DROP TABLE x"));
        assert!(!is_valid_table_name(""));
        assert!(!is_valid_table_name("wp-posts"));
    }

    #[test]
    fn test_export_then_import_into_empty_store() {
        let src_dir = TempDir::new().unwrap();
        let src = store(&src_dir);
        src.execute("CREATE TABLE wp_items (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
        src.execute("CREATE TABLE other_items (id INTEGER)").unwrap();
        src.bulk_insert(
            "wp_items",
            &[row(&[("id", json!(1)), ("name", json!("a"))]), row(&[("id", json!(2)), ("name", json!("b"))])],
        )
        .unwrap();

        let dump = export(&src, &info("wp_")).unwrap();
        assert_eq!(dump.tables.keys().collect::<Vec<_>>(), vec!["wp_items"]);

        let dst_dir = TempDir::new().unwrap();
        let dst = store(&dst_dir);
        let report = import(&dst, &dump, "wp_").unwrap();
        assert_eq!(report.tables, 1);
        assert_eq!(report.rows, 2);
        assert_eq!(dst.query("SELECT * FROM wp_items ORDER BY id").unwrap(), dump.tables["wp_items"].rows);
    }

    #[test]
    fn test_import_skips_bad_names_and_missing_schema() {
        let dir = TempDir::new().unwrap();
        let dst = store(&dir);

        let mut dump = DatabaseDump {
            table_prefix: "wp_".into(),
            ..DatabaseDump::default()
        };
        dump.tables.insert(
            "wp_x; DROP TABLE y".into(),
            TableDump { schema: Some("CREATE TABLE z (a)".into()), rows: vec![] },
        );
        dump.tables.insert("wp_ghost".into(), TableDump { schema: None, rows: vec![row(&[("a", json!(1))])] });

        let report = import(&dst, &dump, "wp_").unwrap();
        assert_eq!(report.tables, 0);
        assert_eq!(report.skipped.len(), 2);
        assert!(!dst.table_exists("z").unwrap());
        assert!(!dst.table_exists("wp_ghost").unwrap());
    }

    #[test]
    fn test_import_truncates_and_names_failing_table() {
        let dir = TempDir::new().unwrap();
        let dst = store(&dir);
        dst.execute("CREATE TABLE wp_items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)").unwrap();
        dst.bulk_insert("wp_items", &[row(&[("id", json!(9)), ("name", json!("old"))])]).unwrap();

        let mut dump = DatabaseDump { table_prefix: "wp_".into(), ..DatabaseDump::default() };
        dump.tables.insert(
            "wp_items".into(),
            TableDump { schema: None, rows: vec![row(&[("id", json!(1)), ("name", Value::Null)])] },
        );

        let err = import(&dst, &dump, "wp_").unwrap_err();
        assert!(matches!(err, TransferError::PartialWrite(ref m) if m.contains("wp_items")));
        // Foreign keys are back on after the failure
        let fk = dst.query("PRAGMA foreign_keys").unwrap();
        assert_eq!(fk[0]["foreign_keys"], json!(1));
    }

    #[test]
    fn test_import_maps_table_prefix() {
        let dir = TempDir::new().unwrap();
        let dst = store(&dir);

        let mut dump = DatabaseDump { table_prefix: "old_".into(), ..DatabaseDump::default() };
        dump.tables.insert(
            "old_things".into(),
            TableDump {
                schema: Some("CREATE TABLE \"old_things\" (id INTEGER)".into()),
                rows: vec![row(&[("id", json!(5))])],
            },
        );

        import(&dst, &dump, "new_").unwrap();
        assert!(dst.table_exists("new_things").unwrap());
        assert!(!dst.table_exists("old_things").unwrap());
    }

    #[test]
    fn test_rewrite_urls() {
        let dir = TempDir::new().unwrap();
        let dst = store(&dir);
        dst.execute("CREATE TABLE wp_posts (id INTEGER, content TEXT, menu_order INTEGER)").unwrap();
        dst.bulk_insert(
            "wp_posts",
            &[row(&[("id", json!(1)), ("content", json!("<img src=\"https://old.test/a.png\">")), ("menu_order", json!(0))])],
        )
        .unwrap();

        let touched = rewrite_urls(&dst, "wp_", "https://old.test/", "https://new.test").unwrap();
        assert_eq!(touched, 1);
        let rows = dst.query("SELECT content FROM wp_posts").unwrap();
        assert_eq!(rows[0]["content"], json!("<img src=\"https://new.test/a.png\">"));
        assert_eq!(rewrite_urls(&dst, "wp_", "https://x.test", "https://x.test").unwrap(), 0);
    }
}
