use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{extract_archive, find_executable, is_process_alive, safe_join, Lifecycle};
use crate::config::Config;
use crate::database::Database;
use crate::models::Component;
use crate::utils;

async fn new_test_lifecycle() -> Result<(Lifecycle, Database, std::path::PathBuf, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let lifecycle = Lifecycle::new(db.clone(), &config.data_dir);
    Ok((lifecycle, db, std::path::PathBuf::from(&config.data_dir), tmpdir))
}

fn script_component(name: &str, content: &str, managed: bool) -> Component {
    Component {
        name: name.to_string(),
        kind: "script".to_string(),
        hash: hex::encode(Sha256::digest(content.as_bytes())),
        content_url: None,
        content_url_encoding: None,
        content: Some(content.to_string()),
        executable: String::new(),
        env: None,
        args: None,
        managed,
        created_at: utils::now(),
        updated_at: utils::now(),
    }
}

fn build_tar_gz(entries: &[(&str, &[u8], u32)]) -> Result<Vec<u8>> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data, mode) in entries {
        let mut header = tar::Header::new_gnu();
        let name = header.as_old_mut().name.as_mut();
        let bytes = path.as_bytes();
        name[..bytes.len()].copy_from_slice(bytes);
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder.append(&header, *data)?;
    }
    Ok(builder.into_inner()?.finish()?)
}

fn build_zip(entries: &[(&str, &[u8], Option<u32>)]) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data, mode) in entries {
        let mut options = zip::write::FileOptions::default();
        if let Some(mode) = mode {
            options = options.unix_permissions(*mode);
        }
        writer.start_file(*name, options)?;
        writer.write_all(data)?;
    }
    Ok(writer.finish()?.into_inner())
}

/// Serve the given bytes to any number of plain HTTP GETs.
async fn serve_bytes(body: &'static [u8]) -> Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let header = format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n", body.len());
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    Ok(format!("http://{}", addr))
}

#[test]
fn safe_join_rejects_escaping_paths() {
    let dest = Path::new("/data/programs/app");
    assert!(safe_join(dest, Path::new("bin/app")).is_ok());
    assert!(safe_join(dest, Path::new("../evil.sh")).is_err());
    assert!(safe_join(dest, Path::new("nested/../../evil.sh")).is_err());
    assert!(safe_join(dest, Path::new("/etc/passwd")).is_err());
}

#[test]
fn tar_gz_traversal_entry_is_rejected() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let archive_path = tmpdir.path().join("evil.tar.gz");
    std::fs::write(&archive_path, build_tar_gz(&[("../evil.sh", b"#!/bin/sh\n", 0o755)])?)?;

    let dest = tmpdir.path().join("dest");
    std::fs::create_dir_all(&dest)?;
    let res = extract_archive(&archive_path, &dest, "tar.gz", "app");
    assert!(res.is_err(), "traversal entry must abort extraction");
    assert!(!tmpdir.path().join("evil.sh").exists(), "nothing may be written outside the destination");
    Ok(())
}

#[test]
fn zip_traversal_entry_is_rejected() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let archive_path = tmpdir.path().join("evil.zip");
    std::fs::write(&archive_path, build_zip(&[("../evil.sh", b"#!/bin/sh\n", Some(0o755))])?)?;

    let dest = tmpdir.path().join("dest");
    std::fs::create_dir_all(&dest)?;
    let res = extract_archive(&archive_path, &dest, "zip", "app");
    assert!(res.is_err(), "traversal entry must abort extraction");
    assert!(!tmpdir.path().join("evil.sh").exists(), "nothing may be written outside the destination");
    Ok(())
}

#[test]
fn tar_gz_extracts_tree_and_finds_named_executable() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let archive_path = tmpdir.path().join("app.tar.gz");
    let archive = build_tar_gz(&[
        ("README.md", b"docs".as_slice(), 0o644),
        ("bin/helper", b"#!/bin/sh\n".as_slice(), 0o755),
        ("bin/app", b"#!/bin/sh\n".as_slice(), 0o755),
    ])?;
    std::fs::write(&archive_path, archive)?;

    let dest = tmpdir.path().join("dest");
    std::fs::create_dir_all(&dest)?;
    extract_archive(&archive_path, &dest, "tar.gz", "app")?;

    let executable = find_executable(&dest, "app")?;
    assert_eq!(executable, dest.join("bin/app"), "basename match wins over other executables");
    Ok(())
}

#[test]
fn zip_extracts_with_unix_modes() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let archive_path = tmpdir.path().join("app.zip");
    std::fs::write(
        &archive_path,
        build_zip(&[("app", b"#!/bin/sh\n", Some(0o755)), ("data.txt", b"data", Some(0o644))])?,
    )?;

    let dest = tmpdir.path().join("dest");
    std::fs::create_dir_all(&dest)?;
    extract_archive(&archive_path, &dest, "zip", "app")?;

    let mode = std::fs::metadata(dest.join("app"))?.permissions().mode();
    assert_ne!(mode & 0o111, 0, "executable bit must survive zip extraction");
    assert_eq!(find_executable(&dest, "app")?, dest.join("app"));
    Ok(())
}

#[test]
fn plain_encoding_places_an_executable_file() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let src = tmpdir.path().join("download");
    std::fs::write(&src, b"#!/bin/sh\n")?;

    let dest = tmpdir.path().join("dest");
    std::fs::create_dir_all(&dest)?;
    extract_archive(&src, &dest, "", "app")?;

    let executable = find_executable(&dest, "app")?;
    assert_eq!(executable, dest.join("app"));
    Ok(())
}

#[test]
fn unknown_encoding_is_rejected() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let src = tmpdir.path().join("download");
    std::fs::write(&src, b"data")?;
    assert!(extract_archive(&src, tmpdir.path(), "rar", "app").is_err());
    Ok(())
}

#[test]
fn find_executable_falls_back_to_first_executable() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join("tool");
    std::fs::write(&path, b"#!/bin/sh\n")?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    std::fs::write(tmpdir.path().join("notes.txt"), b"text")?;

    assert_eq!(find_executable(tmpdir.path(), "app")?, path);
    Ok(())
}

#[test]
fn find_executable_errors_when_nothing_is_executable() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    std::fs::write(tmpdir.path().join("notes.txt"), b"text")?;
    assert!(find_executable(tmpdir.path(), "app").is_err());
    Ok(())
}

#[test]
fn process_liveness_probe_semantics() {
    assert!(!is_process_alive(0));
    assert!(!is_process_alive(-1));
    assert!(is_process_alive(std::process::id() as i32), "the current process is alive");
}

#[tokio::test]
async fn stop_is_a_noop_for_a_component_that_never_ran() -> Result<()> {
    let (lifecycle, _db, _data_dir, _tmpdir) = new_test_lifecycle().await?;
    lifecycle.stop_component("ghost").await?;
    Ok(())
}

#[tokio::test]
async fn managed_script_starts_stops_and_restarts() -> Result<()> {
    let (lifecycle, db, data_dir, _tmpdir) = new_test_lifecycle().await?;

    lifecycle.deploy_script(script_component("sleeper", "#!/bin/sh\nsleep 300\n", true)).await?;

    let status = db.get_component_status("sleeper").await?;
    assert_eq!(status.status, "running");
    assert!(status.pid > 0);
    assert!(is_process_alive(status.pid));
    assert!(data_dir.join("scripts/sleeper.sh").exists());

    lifecycle.stop_component("sleeper").await?;
    let status = db.get_component_status("sleeper").await?;
    assert_eq!(status.status, "stopped");
    assert!(!is_process_alive(status.pid));

    lifecycle.restart_component("sleeper").await?;
    let status = db.get_component_status("sleeper").await?;
    assert_eq!(status.status, "running");
    assert_eq!(status.restart_count, 1);

    lifecycle.stop_component("sleeper").await?;
    Ok(())
}

#[tokio::test]
async fn starting_a_running_component_is_a_noop() -> Result<()> {
    let (lifecycle, db, _data_dir, _tmpdir) = new_test_lifecycle().await?;

    lifecycle.deploy_script(script_component("sleeper", "#!/bin/sh\nsleep 300\n", true)).await?;
    let first = db.get_component_status("sleeper").await?;

    lifecycle.start_component("sleeper").await?;
    let second = db.get_component_status("sleeper").await?;
    assert_eq!(first.pid, second.pid, "an alive component is not respawned");

    lifecycle.stop_component("sleeper").await?;
    Ok(())
}

#[tokio::test]
async fn unmanaged_script_executes_once_and_appends_output() -> Result<()> {
    let (lifecycle, db, data_dir, _tmpdir) = new_test_lifecycle().await?;

    lifecycle.deploy_script(script_component("oneshot", "#!/bin/sh\necho output-marker\n", false)).await?;

    let log = std::fs::read_to_string(data_dir.join("logs/oneshot.log"))?;
    assert!(log.contains("output-marker"), "script output lands in the component log");
    let status = db.get_component_status("oneshot").await?;
    assert_eq!(status.status, "unknown", "one-shot scripts are not supervised");
    Ok(())
}

#[tokio::test]
async fn failing_unmanaged_script_surfaces_the_error() -> Result<()> {
    let (lifecycle, _db, _data_dir, _tmpdir) = new_test_lifecycle().await?;
    let res = lifecycle.deploy_script(script_component("broken", "#!/bin/sh\nexit 3\n", false)).await;
    assert!(res.is_err());
    Ok(())
}

#[tokio::test]
async fn program_download_rejects_hash_mismatch() -> Result<()> {
    let (lifecycle, db, _data_dir, _tmpdir) = new_test_lifecycle().await?;
    let url = serve_bytes(b"#!/bin/sh\nsleep 300\n").await?;

    let mut component = script_component("payload", "", true);
    component.kind = "program".to_string();
    component.content = None;
    component.content_url = Some(format!("{}/payload", url));
    component.hash = "0000000000000000000000000000000000000000000000000000000000000000".to_string();

    let res = lifecycle.deploy_program(component).await;
    let err = format!("{:#}", res.expect_err("mismatched hash must fail the deployment"));
    assert!(err.contains("hash mismatch"), "unexpected error: {}", err);
    assert!(db.get_component("payload").await?.is_none(), "a mismatched download is never persisted");
    Ok(())
}

#[tokio::test]
async fn program_deploys_verifies_starts_and_removes() -> Result<()> {
    let (lifecycle, db, data_dir, _tmpdir) = new_test_lifecycle().await?;
    const BODY: &[u8] = b"#!/bin/sh\nsleep 300\n";
    let url = serve_bytes(BODY).await?;

    let mut component = script_component("payload", "", true);
    component.kind = "program".to_string();
    component.content = None;
    component.content_url = Some(format!("{}/payload", url));
    component.hash = hex::encode(Sha256::digest(BODY));

    lifecycle.deploy_program(component.clone()).await?;

    let status = db.get_component_status("payload").await?;
    assert_eq!(status.status, "running");
    assert!(is_process_alive(status.pid));
    let stored = db.get_component("payload").await?.expect("component should exist");
    assert!(stored.executable.starts_with(data_dir.join("programs/payload").to_string_lossy().as_ref()));

    // Redeploying the same hash is a no-op: the bogus URL proves no second
    // download happens.
    let mut same = component;
    same.content_url = Some("http://127.0.0.1:1/unreachable".to_string());
    lifecycle.deploy_program(same).await?;

    let pid = db.get_component_status("payload").await?.pid;
    lifecycle.remove_component("payload").await?;
    assert!(db.get_component("payload").await?.is_none());
    assert!(!data_dir.join("programs/payload").exists(), "extracted tree is deleted");
    assert!(!is_process_alive(pid), "the supervised process is stopped on removal");
    Ok(())
}
