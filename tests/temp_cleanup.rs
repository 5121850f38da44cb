//! Temp spool files must be gone after downloads and syncs return, on
//! success and on failure alike. Runs alone in its own binary so other
//! tests' spool activity cannot race the directory scans.

mod common;

use common::MockS3;
use s3flux::s3::types::{GetOptions, LargeFileOptions};

const MIB: u64 = 1024 * 1024;

fn spool_files() -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(std::env::temp_dir())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| {
            name.starts_with("aws-v4-get")
                || name.starts_with("aws-v4-sync-large")
                || name.starts_with("aws-v4-sync-all")
        })
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_spool_files_removed_on_all_paths() {
    let before = spool_files();

    let mock = MockS3::new();
    let client = mock.client();
    let data: Vec<u8> = (0..(12 * MIB) as usize).map(|i| (i % 251) as u8).collect();
    mock.put_object("b", "spool.bin", &data);

    // Successful parallel download.
    let dir = tempfile::tempdir().unwrap();
    client
        .get(
            "b",
            "spool.bin",
            &dir.path().join("out.bin"),
            &GetOptions {
                part_size: Some(5 * MIB),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

    // Successful cross-endpoint sync.
    let to_mock = MockS3::new();
    let to = to_mock.client();
    client
        .sync_large_file(
            &to,
            "dstb",
            "synced.bin",
            "/b/spool.bin",
            &LargeFileOptions {
                part_size: Some(5 * MIB),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

    // Failing download: every ranged GET errors out.
    mock.fail_request("GET", "spool.bin", 100, 500);
    client
        .get(
            "b",
            "spool.bin",
            &dir.path().join("fail.bin"),
            &GetOptions {
                part_size: Some(5 * MIB),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap_err();

    assert_eq!(spool_files(), before);
}
