#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use transfer_engine::archive::BackendPreference;
use transfer_engine::site::PostFields;
use transfer_engine::{Config, TransferContext};

pub struct TestSite {
    pub dir: TempDir,
    pub ctx: Arc<TransferContext>,
}

impl TestSite {
    pub fn new(site_url: &str) -> Self {
        Self::with_backend(site_url, BackendPreference::Zip)
    }

    pub fn with_backend(site_url: &str, backend: BackendPreference) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::for_site(&dir.path().join("www"), &dir.path().join("data"));
        config.site.site_url = site_url.to_string();
        config.archive.backend = backend;
        config.snapshots.retention = 2;

        let paths = config.site_paths();
        for path in [&paths.uploads, &paths.plugins, &paths.mu_plugins, &paths.themes] {
            std::fs::create_dir_all(path).unwrap();
        }

        let ctx = TransferContext::open(config).unwrap();
        Self { dir, ctx }
    }

    pub fn write_file(&self, path: &Path, contents: &[u8]) -> PathBuf {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
        path.to_path_buf()
    }

    pub fn page(&self, id: Option<i64>, title: &str, slug: &str, content: &str) -> i64 {
        self.ctx
            .site
            .content
            .upsert_post(&PostFields {
                id,
                post_type: "page".into(),
                title: title.into(),
                slug: slug.into(),
                content: content.into(),
                status: "publish".into(),
                ..PostFields::default()
            })
            .unwrap()
    }

    /// Copy an archive produced elsewhere into this site's archives directory.
    pub fn receive(&self, archive: &Path) -> String {
        let name = archive.file_name().unwrap().to_string_lossy().into_owned();
        std::fs::copy(archive, self.ctx.packer.archives_dir().join(&name)).unwrap();
        name
    }
}
