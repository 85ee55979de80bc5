//! History scans against real git repositories. Skipped when git is not installed.

use gitbits_git::{find_executable, BitsConfig, GitError, Repository, ScanStage, StderrSink};
use gitbits_reduce::{Key, Sentinels};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn git_bytes(dir: &Path, args: &[&str]) -> Vec<u8> {
    let out = Command::new("git")
        .args([
            "-c",
            "user.name=git-bits tests",
            "-c",
            "user.email=tests@example.com",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    out.stdout
}

fn git(dir: &Path, args: &[&str]) -> String {
    String::from_utf8(git_bytes(dir, args)).unwrap().trim().to_string()
}

fn commit_all(dir: &Path, message: &str) -> String {
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", message]);
    git(dir, &["rev-parse", "HEAD"])
}

fn random_data(seed: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

fn setup() -> Option<(TempDir, Repository)> {
    find_executable("git")?;
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "-q"]);

    let mut config = BitsConfig {
        stderr: StderrSink::Discard,
        ..BitsConfig::default()
    };
    config.chunker.min_size = 4 * 1024;
    config.chunker.max_size = 64 * 1024;
    config.chunker.average_bits = 13;
    let repo = Repository::open_with_config(dir.path(), config).unwrap();
    Some((dir, repo))
}

/// Clean `data` and commit the resulting key blob at `name`
fn add_key_blob(repo: &Repository, name: &str, data: &[u8]) -> Vec<Key> {
    let mut framed = Vec::new();
    let summary = repo.clean(data, &mut framed).unwrap();
    std::fs::write(repo.work_dir().join(name), framed).unwrap();
    summary.keys
}

fn parse_keys(out: &[u8]) -> Vec<Key> {
    String::from_utf8_lossy(out)
        .lines()
        .map(|line| line.parse().unwrap())
        .collect()
}

#[tokio::test]
async fn test_scan_finds_keys_between_commits() {
    let Some((dir, repo)) = setup() else {
        eprintln!("git not found, skipping");
        return;
    };

    std::fs::write(dir.path().join("README"), "plain text file\n").unwrap();
    let first_keys = add_key_blob(&repo, "first.bin", &random_data(1, 100_000));
    let first = commit_all(dir.path(), "first");

    // a blob whose size looks like a key list but carries no header
    std::fs::write(dir.path().join("decoy.txt"), vec![b'a'; 130]).unwrap();
    let second_keys = add_key_blob(&repo, "second.bin", &random_data(2, 150_000));
    let second = commit_all(dir.path(), "second");

    let mut out = Vec::new();
    let report = repo.scan(&first, &second, &mut out).await.unwrap();
    assert_eq!(report.key_blobs, 1);
    assert_eq!(report.keys, second_keys.len());
    assert!(report.warnings.is_empty());
    assert_eq!(parse_keys(&out), second_keys);

    let mut all = Vec::new();
    let report = repo.scan("", &second, &mut all).await.unwrap();
    assert_eq!(report.key_blobs, 2);
    let mut found = parse_keys(&all);
    let mut expected: Vec<Key> = first_keys.iter().chain(second_keys.iter()).copied().collect();
    found.sort();
    expected.sort();
    assert_eq!(found, expected);
}

#[tokio::test]
async fn test_scanned_keys_are_in_the_store() {
    let Some((dir, repo)) = setup() else {
        return;
    };
    add_key_blob(&repo, "asset.bin", &random_data(3, 80_000));
    commit_all(dir.path(), "asset");

    let mut out = Vec::new();
    repo.scan("", "HEAD", &mut out).await.unwrap();
    let keys = parse_keys(&out);
    assert!(!keys.is_empty());
    for key in keys {
        assert!(repo.store().contains(&key));
    }
}

#[tokio::test]
async fn test_scan_of_unchanged_range_is_empty() {
    let Some((dir, repo)) = setup() else {
        return;
    };
    add_key_blob(&repo, "asset.bin", &random_data(4, 50_000));
    let head = commit_all(dir.path(), "asset");

    let mut out = Vec::new();
    let report = repo.scan(&head, &head, &mut out).await.unwrap();
    assert_eq!(report.key_blobs, 0);
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_bad_revision_fails_in_list_stage() {
    let Some((dir, repo)) = setup() else {
        return;
    };
    std::fs::write(dir.path().join("README"), "hello\n").unwrap();
    commit_all(dir.path(), "init");

    let mut out = Vec::new();
    let err = repo
        .scan("", "no-such-branch", &mut out)
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(ScanStage::ListObjects));
    assert!(err.to_string().contains("list-objects"));
    assert!(!err.is_cancelled());
}

#[tokio::test]
async fn test_cancelled_scan() {
    let Some((dir, repo)) = setup() else {
        return;
    };
    add_key_blob(&repo, "asset.bin", &random_data(5, 50_000));
    commit_all(dir.path(), "asset");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut out = Vec::new();
    let err = repo
        .scan_with_cancel("", "HEAD", &mut out, cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "unexpected error: {err}");
}

#[tokio::test]
async fn test_git_output() {
    let Some((dir, repo)) = setup() else {
        return;
    };
    std::fs::write(dir.path().join("README"), "hello\n").unwrap();
    let head = commit_all(dir.path(), "init");
    assert_eq!(repo.git_output(&["rev-parse", "HEAD"]).await.unwrap(), head);

    let err = repo.git_output(&["rev-parse", "nope^{commit}"]).await.unwrap_err();
    assert!(matches!(err, GitError::CommandFailed { .. }));
}

#[test]
fn test_binary_as_git_filter() {
    if find_executable("git").is_none() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let path = dir.path();
    git(path, &["init", "-q"]);

    let bin = env!("CARGO_BIN_EXE_git-bits");
    git(path, &["config", "filter.bits.clean", &format!("'{bin}' split")]);
    git(path, &["config", "filter.bits.smudge", &format!("'{bin}' combine")]);
    git(path, &["config", "filter.bits.required", "true"]);
    std::fs::write(path.join(".gitattributes"), "*.bin filter=bits\n").unwrap();

    let original = random_data(6, 5 * 1024 * 1024);
    std::fs::write(path.join("asset.bin"), &original).unwrap();
    let c0 = commit_all(path, "c0");

    let mut edited = original.clone();
    edited[5] ^= 0xff;
    std::fs::write(path.join("asset.bin"), &edited).unwrap();
    let c1 = commit_all(path, "c1");

    // history holds key lists, the working tree holds content
    let blob = git_bytes(path, &["cat-file", "blob", &format!("{c1}:asset.bin")]);
    let committed = Sentinels::default().unframe(&blob[..]).unwrap();
    assert!(!committed.is_empty());
    assert_eq!(blob.len() % gitbits_reduce::KEY_LINE_WIDTH, 0);

    git(path, &["checkout", "-q", &c0]);
    assert!(std::fs::read(path.join("asset.bin")).unwrap() == original);
    git(path, &["checkout", "-q", &c1]);
    assert!(std::fs::read(path.join("asset.bin")).unwrap() == edited);

    let out = Command::new(bin)
        .args(["scan", c0.as_str(), c1.as_str()])
        .current_dir(path)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "scan failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert_eq!(parse_keys(&out.stdout), committed);

    let failed = Command::new(bin)
        .args(["scan", "", "no-such-branch"])
        .current_dir(path)
        .output()
        .unwrap();
    assert!(!failed.status.success());
    assert!(String::from_utf8_lossy(&failed.stderr).contains("list-objects"));
}
