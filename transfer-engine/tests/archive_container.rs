use serde_json::json;
use tempfile::TempDir;
use transfer_engine::archive::checksum::sha256_hex;
use transfer_engine::archive::{
    self, ArchiveMeta, ArchiveType, Asset, AttachmentManifestEntry, BackendKind, Packer, MANIFEST_PATH,
    PAYLOAD_PATH,
};
use transfer_engine::TransferError;

fn media_entry(id: i64, filename: &str, bytes: &[u8]) -> AttachmentManifestEntry {
    AttachmentManifestEntry {
        original_id: id,
        parent_id: 42,
        filename: filename.into(),
        mime_type: "image/jpeg".into(),
        filesize: bytes.len() as u64,
        checksum: sha256_hex(bytes),
        source_url: format!("https://old.test/content/uploads/{}", filename),
        title: String::new(),
        alt: String::new(),
        caption: String::new(),
        description: String::new(),
        archive_path: format!("media/{}-{}", id, filename),
    }
}

#[test]
fn test_round_trip_on_both_backends() {
    for kind in [BackendKind::Zip, BackendKind::Tar] {
        let dir = TempDir::new().unwrap();
        let packer = Packer::new(&dir.path().join("archives"), kind);
        let photo = dir.path().join("photo.jpg");
        let bytes = vec![7u8; 200_000];
        std::fs::write(&photo, &bytes).unwrap();

        let payload = json!({"id": 42, "title": "Hello", "slug": "hello", "post_type": "page"});
        let mut meta = ArchiveMeta::new(ArchiveType::Page, "Hello");
        meta.media = vec![media_entry(7, "photo.jpg", &bytes)];
        let assets = vec![Asset {
            source: photo,
            target: "media/7-photo.jpg".into(),
        }];

        let path = packer.create_archive(&payload, meta, &assets).unwrap();
        assert_eq!(BackendKind::detect(&path).unwrap(), kind);

        let extracted = archive::extract(&path).unwrap();
        assert_eq!(extracted.payload, payload);
        assert_eq!(extracted.archive_type, ArchiveType::Page);
        assert_eq!(extracted.manifest.format_version, 1);
        assert_eq!(extracted.media.len(), 1);

        let names: Vec<String> = archive::list_entries(&path)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(names.contains(&MANIFEST_PATH.to_string()));
        assert!(names.contains(&PAYLOAD_PATH.to_string()));

        let temp = archive::extract_media_file("media/7-photo.jpg", &path).unwrap();
        assert_eq!(std::fs::read(&temp).unwrap(), bytes);
        std::fs::remove_file(temp).unwrap();
    }
}

#[test]
fn test_tampered_payload_fails_integrity() {
    for kind in [BackendKind::Zip, BackendKind::Tar] {
        let dir = TempDir::new().unwrap();
        let packer = Packer::new(dir.path(), kind);
        let original = packer
            .create_archive(&json!({"title": "Hello"}), ArchiveMeta::new(ArchiveType::Page, "Hello"), &[])
            .unwrap();
        let manifest = archive::read_entry(&original, MANIFEST_PATH).unwrap().unwrap();

        // Same manifest, different payload bytes
        let forged = dir.path().join(format!("forged.{}", kind.extension()));
        let mut writer = kind.create(&forged).unwrap();
        writer.add_bytes(MANIFEST_PATH, &manifest).unwrap();
        writer.add_bytes(PAYLOAD_PATH, br#"{"title":"Hacked"}"#).unwrap();
        writer.finish().unwrap();

        let err = archive::extract(&forged).unwrap_err();
        assert!(matches!(err, TransferError::Integrity(_)), "{:?}", err);
    }
}

#[test]
fn test_missing_manifest_is_format_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bare.zip");
    let mut writer = BackendKind::Zip.create(&path).unwrap();
    writer.add_bytes(PAYLOAD_PATH, b"{}").unwrap();
    writer.finish().unwrap();

    assert!(matches!(archive::extract(&path), Err(TransferError::Format(_))));
}

#[test]
fn test_unknown_container_is_format_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, b"just some text, not an archive").unwrap();

    assert!(matches!(archive::extract(&path), Err(TransferError::Format(_))));
}
