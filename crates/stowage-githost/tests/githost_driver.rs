//! Driver tests against a mock git-hosting backend.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use tiny_http::{Header, Response, Server};

use stowage_core::{ByteSource, MultipartComplete, MultipartInitRequest, OpContext, StorageDriver};
use stowage_githost::{GitHostDriver, SUBMODULE_MIMETYPE};
use stowage_sessions::MemorySessionStore;
use stowage_types::{
    Capability, CopyOptions, DriverConfig, DriverKind, ErrorCode, ListOptions, UploadOptions,
};

type RequestLog = Arc<Mutex<Vec<(String, String, String)>>>;

fn spawn_host<F>(handler: F) -> (String, RequestLog)
where
    F: Fn(&str, &str, &str) -> Response<std::io::Cursor<Vec<u8>>> + Send + Sync + 'static,
{
    let server = Server::http("127.0.0.1:0").expect("server");
    let addr = format!("http://{}", server.server_addr());
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let log_in = Arc::clone(&log);
    std::thread::spawn(move || {
        for mut request in server.incoming_requests() {
            let mut body = String::new();
            let _ = request.as_reader().read_to_string(&mut body);
            let method = request.method().as_str().to_string();
            let url = request.url().to_string();
            log_in
                .lock()
                .expect("log")
                .push((method.clone(), url.clone(), body.clone()));
            let _ = request.respond(handler(&method, &url, &body));
        }
    });
    (addr, log)
}

fn json(body: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    Response::from_string(body).with_header(
        Header::from_bytes("Content-Type", "application/json").expect("header"),
    )
}

fn not_found() -> Response<std::io::Cursor<Vec<u8>>> {
    Response::from_string(r#"{"message": "Not Found"}"#).with_status_code(404)
}

/// Routes shared by every write-pipeline test.
fn pipeline_route(method: &str, url: &str) -> Option<Response<std::io::Cursor<Vec<u8>>>> {
    match (method, url) {
        ("GET", "/repos/org/repo") => Some(json(
            r#"{"private": false, "default_branch": "main", "size": 12}"#,
        )),
        ("GET", "/repos/org/repo/git/ref/heads/main") => {
            Some(json(r#"{"object": {"sha": "headsha"}}"#))
        }
        ("GET", "/repos/org/repo/git/commits/headsha") => {
            Some(json(r#"{"tree": {"sha": "basetree"}}"#))
        }
        ("POST", "/repos/org/repo/git/blobs") => Some(json(r#"{"sha": "blob1"}"#)),
        ("POST", "/repos/org/repo/git/trees") => Some(json(r#"{"sha": "tree1"}"#)),
        ("POST", "/repos/org/repo/git/commits") => Some(json(r#"{"sha": "commit1"}"#)),
        ("PATCH", "/repos/org/repo/git/refs/heads/main") => {
            Some(json(r#"{"ref": "refs/heads/main"}"#))
        }
        _ => None,
    }
}

fn make_driver(addr: &str, token: Option<&str>, reference: &str) -> GitHostDriver {
    make_driver_with_sessions(addr, token, reference, Arc::new(MemorySessionStore::new()))
}

fn make_driver_with_sessions(
    addr: &str,
    token: Option<&str>,
    reference: &str,
    sessions: Arc<MemorySessionStore>,
) -> GitHostDriver {
    let mut config = DriverConfig::new("ghost", DriverKind::GitHost)
        .with_endpoint(addr)
        .with_backend(serde_json::json!({
            "owner": "org",
            "repo": "repo",
            "reference": reference,
            "raw_endpoint": addr,
        }));
    if let Some(token) = token {
        config = config.with_credential(token);
    }
    config.options.write_throttle = Duration::ZERO;
    config.options.part_size = Some(6);
    let mut driver = GitHostDriver::new(config, sessions).expect("driver");
    driver.initialize(None).expect("initialize");
    driver
}

#[test]
fn capabilities_follow_token_privacy_and_reference() {
    let (addr, _log) = spawn_host(|method, url, _| {
        pipeline_route(method, url).unwrap_or_else(not_found)
    });

    let writable = make_driver(&addr, Some("gh_token"), "main");
    assert!(writable.capabilities().contains(Capability::Writer));
    assert!(writable.capabilities().contains(Capability::DirectLink));

    let readonly = make_driver(&addr, None, "main");
    assert!(!readonly.capabilities().contains(Capability::Writer));

    let tagged = make_driver(&addr, Some("gh_token"), "refs/tags/v1");
    assert!(!tagged.capabilities().contains(Capability::Writer));
}

#[test]
fn listing_maps_entries_and_hides_gitkeep() {
    let (addr, _log) = spawn_host(|method, url, _| {
        if method == "GET" && url.starts_with("/repos/org/repo/contents/docs") {
            return json(
                r#"{"type": "dir", "entries": [
                    {"name": "a.txt", "path": "docs/a.txt", "sha": "s1", "size": 3, "type": "file"},
                    {"name": ".gitkeep", "path": "docs/.gitkeep", "sha": "s2", "size": 0, "type": "file"},
                    {"name": "vendored", "path": "docs/vendored", "sha": "s3", "size": 0, "type": "submodule"},
                    {"name": "sub", "path": "docs/sub", "sha": "s4", "size": 0, "type": "dir"}
                ]}"#,
            );
        }
        pipeline_route(method, url).unwrap_or_else(not_found)
    });

    let driver = make_driver(&addr, None, "main");
    let cx = OpContext::new();
    let listing = driver
        .list_directory(&cx, "/docs/", &ListOptions::default())
        .expect("list");

    let names: Vec<&str> = listing.items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "vendored", "sub"]);

    let submodule = &listing.items[1];
    assert_eq!(submodule.mimetype, SUBMODULE_MIMETYPE);
    assert!(!submodule.is_directory);
    assert_eq!(listing.items[2].path, "/docs/sub/");
}

#[test]
fn submodules_refuse_download() {
    let (addr, _log) = spawn_host(|method, url, _| {
        if method == "GET" && url.starts_with("/repos/org/repo/contents/vendored") {
            return json(r#"{"type": "submodule", "name": "vendored", "sha": "s3", "size": 0}"#);
        }
        pipeline_route(method, url).unwrap_or_else(not_found)
    });

    let driver = make_driver(&addr, None, "main");
    let cx = OpContext::new();
    let err = driver.download_file(&cx, "/vendored").expect_err("refused");
    assert_eq!(err.code(), ErrorCode::SubmoduleUnsupported);
}

#[test]
fn oversize_upload_fails_before_any_network_call() {
    let (addr, log) = spawn_host(|method, url, _| {
        pipeline_route(method, url).unwrap_or_else(not_found)
    });
    let driver = make_driver(&addr, Some("gh_token"), "main");
    // Force the log to only contain the init probe.
    log.lock().expect("log").clear();

    let cx = OpContext::new();
    let oversize = 120 * 1024 * 1024u64;
    let reader = std::io::repeat(0).take(oversize);
    let err = driver
        .upload_file(
            &cx,
            "/big.bin",
            ByteSource::from_reader(Box::new(reader), Some(oversize)),
            &UploadOptions::default(),
        )
        .expect_err("too large");
    assert_eq!(err.code(), ErrorCode::FileTooLarge);
    assert!(log.lock().expect("log").is_empty());
}

#[test]
fn upload_runs_the_full_write_pipeline() {
    let (addr, log) = spawn_host(|method, url, _| {
        pipeline_route(method, url).unwrap_or_else(not_found)
    });
    let driver = make_driver(&addr, Some("gh_token"), "main");
    let cx = OpContext::new();
    let outcome = driver
        .upload_file(
            &cx,
            "/docs/a.txt",
            ByteSource::from_bytes(b"hello".to_vec()),
            &UploadOptions::default(),
        )
        .expect("upload");
    assert_eq!(outcome.storage_path, "/docs/a.txt");

    let log = log.lock().expect("log");
    let writes: Vec<&(String, String, String)> = log
        .iter()
        .filter(|(m, _, _)| m == "POST" || m == "PATCH")
        .collect();
    assert_eq!(writes.len(), 4);
    assert!(writes[0].1.ends_with("/git/blobs"));
    assert!(writes[1].1.ends_with("/git/trees"));
    assert!(writes[2].1.ends_with("/git/commits"));
    assert!(writes[3].1.ends_with("/git/refs/heads/main"));

    // Blob body is streamed base64 JSON.
    let blob: serde_json::Value = serde_json::from_str(&writes[0].2).expect("blob body");
    assert_eq!(blob["encoding"], "base64");
    assert_eq!(
        blob["content"],
        base64::engine::general_purpose::STANDARD.encode(b"hello")
    );

    let tree: serde_json::Value = serde_json::from_str(&writes[1].2).expect("tree body");
    assert_eq!(tree["base_tree"], "basetree");
    assert_eq!(tree["tree"][0]["path"], "docs/a.txt");
    assert_eq!(tree["tree"][0]["mode"], "100644");

    let commit: serde_json::Value = serde_json::from_str(&writes[2].2).expect("commit body");
    assert_eq!(commit["tree"], "tree1");
    assert_eq!(commit["parents"][0], "headsha");

    let patch: serde_json::Value = serde_json::from_str(&writes[3].2).expect("patch body");
    assert_eq!(patch["sha"], "commit1");
    assert_eq!(patch["force"], false);
}

#[test]
fn truncated_tree_aborts_copy_without_a_commit() {
    let (addr, log) = spawn_host(|method, url, _| {
        if method == "GET" && url.starts_with("/repos/org/repo/git/trees/basetree") {
            return json(r#"{"sha": "basetree", "tree": [], "truncated": true}"#);
        }
        pipeline_route(method, url).unwrap_or_else(not_found)
    });

    let driver = make_driver(&addr, Some("gh_token"), "main");
    let cx = OpContext::new();
    let err = driver
        .copy_item(&cx, "/src/", "/dst/", &CopyOptions::default())
        .expect_err("truncated");
    assert_eq!(err.code(), ErrorCode::TreeTruncated);
    assert!(!log
        .lock()
        .expect("log")
        .iter()
        .any(|(m, u, _)| m == "POST" && u.ends_with("/git/commits")));
}

#[test]
fn rename_reuses_blob_shas_and_deletes_source() {
    let (addr, log) = spawn_host(|method, url, _| {
        if method == "GET" && url.starts_with("/repos/org/repo/contents/old.txt") {
            return json(r#"{"type": "file", "name": "old.txt", "sha": "oldsha", "size": 5}"#);
        }
        pipeline_route(method, url).unwrap_or_else(not_found)
    });

    let driver = make_driver(&addr, Some("gh_token"), "main");
    let cx = OpContext::new();
    driver.rename_item(&cx, "/old.txt", "/new.txt").expect("rename");

    let log = log.lock().expect("log");
    // No blob creation: the existing sha is reused.
    assert!(!log.iter().any(|(m, u, _)| m == "POST" && u.ends_with("/git/blobs")));
    let tree = log
        .iter()
        .find(|(m, u, _)| m == "POST" && u.ends_with("/git/trees"))
        .expect("tree posted");
    let body: serde_json::Value = serde_json::from_str(&tree.2).expect("tree body");
    let entries = body["tree"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["path"], "new.txt");
    assert_eq!(entries[0]["sha"], "oldsha");
    assert_eq!(entries[1]["path"], "old.txt");
    assert!(entries[1]["sha"].is_null());
}

#[test]
fn empty_repo_bootstraps_on_first_write() {
    let bootstrapped = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&bootstrapped);
    let (addr, log) = spawn_host(move |method, url, _| {
        if method == "GET" && url == "/repos/org/repo/git/ref/heads/main" {
            if *flag.lock().expect("flag") {
                return json(r#"{"object": {"sha": "headsha"}}"#);
            }
            return not_found();
        }
        if method == "PUT" && url == "/repos/org/repo/contents/.gitkeep" {
            *flag.lock().expect("flag") = true;
            return json(r#"{"content": {"sha": "seed"}}"#);
        }
        if method == "GET" && url == "/repos/org/repo" {
            return json(r#"{"private": false, "default_branch": "main", "size": 0}"#);
        }
        pipeline_route(method, url).unwrap_or_else(not_found)
    });

    let driver = make_driver(&addr, Some("gh_token"), "main");
    let cx = OpContext::new();
    driver
        .upload_file(
            &cx,
            "/first.txt",
            ByteSource::from_bytes(b"hi".to_vec()),
            &UploadOptions::default(),
        )
        .expect("upload");

    let log = log.lock().expect("log");
    assert!(log
        .iter()
        .any(|(m, u, _)| m == "PUT" && u == "/repos/org/repo/contents/.gitkeep"));
    assert!(log.iter().any(|(m, u, _)| m == "PATCH" && u.contains("/git/refs/")));
}

/// Accept-header-aware variant for routes that differ only by media type.
fn spawn_host_with_accept<F>(handler: F) -> (String, RequestLog)
where
    F: Fn(&str, &str, &str, &str) -> Response<std::io::Cursor<Vec<u8>>> + Send + Sync + 'static,
{
    let server = Server::http("127.0.0.1:0").expect("server");
    let addr = format!("http://{}", server.server_addr());
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let log_in = Arc::clone(&log);
    std::thread::spawn(move || {
        for mut request in server.incoming_requests() {
            let accept = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("accept"))
                .map(|h| h.value.as_str().to_string())
                .unwrap_or_default();
            let mut body = String::new();
            let _ = request.as_reader().read_to_string(&mut body);
            let method = request.method().as_str().to_string();
            let url = request.url().to_string();
            log_in
                .lock()
                .expect("log")
                .push((method.clone(), url.clone(), body.clone()));
            let _ = request.respond(handler(&method, &url, &accept, &body));
        }
    });
    (addr, log)
}

#[test]
fn public_download_prefers_cdn_and_falls_back_to_contents() {
    let (addr, log) = spawn_host_with_accept(|method, url, accept, _| {
        if method == "GET" && url == "/org/repo/main/fresh.txt" {
            // CDN lags behind; real content only via the Contents API.
            return not_found();
        }
        if method == "GET" && url.starts_with("/repos/org/repo/contents/fresh.txt") {
            if accept.contains("object+json") {
                return json(r#"{"type": "file", "name": "fresh.txt", "sha": "s1", "size": 13}"#);
            }
            return Response::from_string("fresh content");
        }
        pipeline_route(method, url).unwrap_or_else(not_found)
    });

    let driver = make_driver(&addr, None, "main");
    let cx = OpContext::new();
    // stat goes through the Contents API too.
    let descriptor = driver.download_file(&cx, "/fresh.txt").expect("descriptor");
    let bytes = descriptor
        .open_full(&cx.cancel)
        .expect("open")
        .read_all(&cx.cancel)
        .expect("read");
    assert_eq!(bytes, b"fresh content");

    let log = log.lock().expect("log");
    assert!(log.iter().any(|(_, u, _)| u == "/org/repo/main/fresh.txt"));
}

#[test]
fn writes_refuse_without_token() {
    let (addr, _log) = spawn_host(|method, url, _| {
        pipeline_route(method, url).unwrap_or_else(not_found)
    });
    let driver = make_driver(&addr, None, "main");
    let cx = OpContext::new();
    let err = driver
        .update_file(&cx, "/a.txt", b"x")
        .expect_err("refused");
    assert_eq!(err.code(), ErrorCode::TokenRequiredForWrite);
}

#[test]
fn multipart_chunks_become_blobs_and_complete_assembles() {
    let sessions = Arc::new(MemorySessionStore::new());
    let blob_store: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let blobs_in = Arc::clone(&blob_store);

    let (addr, log) = spawn_host(move |method, url, body| {
        if method == "POST" && url == "/repos/org/repo/git/blobs" {
            let parsed: serde_json::Value = serde_json::from_str(body).expect("blob body");
            let content = base64::engine::general_purpose::STANDARD
                .decode(parsed["content"].as_str().expect("content"))
                .expect("decode");
            let mut store = blobs_in.lock().expect("blobs");
            store.push(content);
            return json(&format!(r#"{{"sha": "chunk{}"}}"#, store.len()));
        }
        if method == "GET" && url.starts_with("/repos/org/repo/git/blobs/chunk") {
            let idx: usize = url
                .rsplit("chunk")
                .next()
                .and_then(|s| s.parse().ok())
                .expect("index");
            let store = blobs_in.lock().expect("blobs");
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(&store[idx - 1]);
            return json(&format!(
                r#"{{"content": "{encoded}", "encoding": "base64"}}"#
            ));
        }
        pipeline_route(method, url).unwrap_or_else(not_found)
    });

    let driver = make_driver_with_sessions(&addr, Some("gh_token"), "main", sessions);
    let cx = OpContext::new();

    let init = driver
        .initialize_multipart_upload(
            &cx,
            &MultipartInitRequest {
                path: "/big.bin".to_string(),
                size: 11,
                filename: None,
                content_type: None,
                checksum: None,
            },
        )
        .expect("init");

    driver
        .proxy_multipart_chunk(&cx, &init.session_id, 1, ByteSource::from_bytes(b"hello ".to_vec()))
        .expect("part 1");
    driver
        .proxy_multipart_chunk(&cx, &init.session_id, 2, ByteSource::from_bytes(b"world".to_vec()))
        .expect("part 2");

    let parts = driver
        .list_multipart_parts(&cx, &init.session_id)
        .expect("parts");
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].size, Some(6));

    let done = driver
        .complete_multipart_upload(
            &cx,
            &init.session_id,
            &MultipartComplete { parts: vec![] },
        )
        .expect("complete");
    assert_eq!(done.storage_path, "/big.bin");

    // The final commit uploads the assembled content as a fresh blob.
    let blobs = blob_store.lock().expect("blobs");
    assert_eq!(blobs.last().expect("final blob"), b"hello world");
    assert!(log
        .lock()
        .expect("log")
        .iter()
        .any(|(m, u, _)| m == "PATCH" && u.contains("/git/refs/")));
}
