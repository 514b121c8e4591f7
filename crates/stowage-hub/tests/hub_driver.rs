//! Driver tests against a mock hub backend.

use std::io::Read;
use std::sync::{Arc, Mutex};

use tiny_http::{Header, Response, Server};

use stowage_core::{
    ByteRange, ByteSource, MultipartComplete, MultipartInitRequest, OpContext, StorageDriver,
};
use stowage_hub::HubDriver;
use stowage_sessions::MemorySessionStore;
use stowage_types::{
    Capability, DriverConfig, DriverKind, ErrorCode, LinkKind, ListOptions, PartInfo,
    UploadMode, UploadOptions,
};

type RequestLog = Arc<Mutex<Vec<(String, String, String)>>>;

fn spawn_hub<F>(handler: F) -> (String, RequestLog)
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

fn public_repo_info() -> Response<std::io::Cursor<Vec<u8>>> {
    json(r#"{"private": false, "gated": false}"#)
}

fn refs_main() -> Response<std::io::Cursor<Vec<u8>>> {
    json(r#"{"branches": [{"name": "main"}], "tags": [{"name": "v1"}]}"#)
}

fn make_driver(addr: &str, token: Option<&str>, revision: &str) -> HubDriver {
    make_driver_with_sessions(addr, token, revision, Arc::new(MemorySessionStore::new()))
}

fn make_driver_with_sessions(
    addr: &str,
    token: Option<&str>,
    revision: &str,
    sessions: Arc<MemorySessionStore>,
) -> HubDriver {
    let mut config = DriverConfig::new("hub", DriverKind::HubDataset)
        .with_endpoint(addr)
        .with_backend(serde_json::json!({"repo": "org/data", "revision": revision}));
    if let Some(token) = token {
        config = config.with_credential(token);
    }
    let mut driver = HubDriver::new(config, sessions).expect("driver");
    driver.initialize(None).expect("initialize");
    driver
}

#[test]
fn capabilities_depend_on_token_and_revision() {
    let (addr, _log) = spawn_hub(|_, _, _| public_repo_info());

    let writable = make_driver(&addr, Some("hf_token"), "main");
    assert!(writable.capabilities().contains(Capability::Writer));
    assert!(writable.capabilities().contains(Capability::Multipart));

    let readonly = make_driver(&addr, None, "main");
    assert!(readonly.capabilities().contains(Capability::Reader));
    assert!(!readonly.capabilities().contains(Capability::Writer));

    let pinned = make_driver(&addr, Some("hf_token"), &"a".repeat(40));
    assert!(!pinned.capabilities().contains(Capability::Writer));
}

#[test]
fn listing_paginates_and_hides_gitkeep() {
    let (addr, _log) = spawn_hub(move |method, url, _| {
        if method == "GET" && url.starts_with("/api/datasets/org/data/tree/main/docs") {
            if url.contains("cursor=page2") {
                return json(
                    r#"[{"path": "docs/b.txt", "type": "file", "size": 2},
                        {"path": "docs/.gitkeep", "type": "file", "size": 0}]"#,
                );
            }
            // First page links to the second.
            return json(r#"[{"path": "docs/a.txt", "type": "file", "size": 1},
                            {"path": "docs/sub", "type": "directory"}]"#)
                .with_header(
                    Header::from_bytes(
                        "Link",
                        "<http://host/api/datasets/org/data/tree/main/docs?cursor=page2>; rel=\"next\"",
                    )
                    .expect("header"),
                );
        }
        public_repo_info()
    });

    let driver = make_driver(&addr, None, "main");
    let cx = OpContext::new();
    let listing = driver
        .list_directory(&cx, "/docs/", &ListOptions::default())
        .expect("list");

    let names: Vec<&str> = listing.items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "sub", "b.txt"]);
    assert!(!listing.is_root);
    let dir = &listing.items[1];
    assert!(dir.is_directory);
    assert_eq!(dir.path, "/docs/sub/");
}

#[test]
fn paged_listing_reports_cursor() {
    let (addr, _log) = spawn_hub(|method, url, _| {
        if method == "GET" && url.contains("/tree/main") {
            return json(r#"[{"path": "a.bin", "type": "file", "size": 7}]"#).with_header(
                Header::from_bytes(
                    "Link",
                    "<http://host/api/datasets/org/data/tree/main?cursor=abc123>; rel=\"next\"",
                )
                .expect("header"),
            );
        }
        public_repo_info()
    });

    let driver = make_driver(&addr, None, "main");
    let cx = OpContext::new();
    let listing = driver
        .list_directory(
            &cx,
            "/",
            &ListOptions { paged: true, ..Default::default() },
        )
        .expect("list");
    assert_eq!(listing.has_more, Some(true));
    assert_eq!(listing.next_cursor.as_deref(), Some("abc123"));
}

#[test]
fn stat_resolves_through_paths_info() {
    let (addr, log) = spawn_hub(|method, url, _| {
        if method == "POST" && url.contains("/paths-info/main") {
            return json(
                r#"[{"path": "docs/a.txt", "type": "file", "size": 13,
                     "lastCommit": {"date": "2025-05-01T12:00:00.000Z"}}]"#,
            );
        }
        public_repo_info()
    });

    let driver = make_driver(&addr, None, "main");
    let cx = OpContext::new();
    let record = driver.stat(&cx, "/docs/a.txt").expect("stat");
    assert_eq!(record.size, Some(13));
    assert!(!record.is_directory);
    assert_eq!(record.mimetype, "text/plain");
    assert!(record.modified.is_some());

    // A second stat inside the TTL is served from cache.
    driver.stat(&cx, "/docs/a.txt").expect("stat again");
    let posts = log
        .lock()
        .expect("log")
        .iter()
        .filter(|(m, u, _)| m == "POST" && u.contains("paths-info"))
        .count();
    assert_eq!(posts, 1);
}

#[test]
fn upload_dedup_skips_transfer_but_commits() {
    let (addr, log) = spawn_hub(|method, url, _| {
        if url.contains("/info/lfs/objects/batch") {
            // No upload action: server already has the content.
            return json(r#"{"objects": [{"oid": "68e656b251e67e8358bef8483ab0d51c6619f3e7a1a9f0e75838d41ff368f728", "size": 13}]}"#);
        }
        if method == "POST" && url.contains("/commit/main") {
            return json(r#"{"success": true}"#);
        }
        if url.contains("/refs") {
            return refs_main();
        }
        public_repo_info()
    });

    let driver = make_driver(&addr, Some("hf_token"), "main");
    let cx = OpContext::new();
    let outcome = driver
        .upload_file(
            &cx,
            "/docs/a.txt",
            ByteSource::from_bytes(b"hello, world!".to_vec()),
            &UploadOptions::default(),
        )
        .expect("upload");
    assert_eq!(outcome.storage_path, "/docs/a.txt");

    let log = log.lock().expect("log");
    assert!(!log.iter().any(|(m, _, _)| m == "PUT"));
    let commit = log
        .iter()
        .find(|(m, u, _)| m == "POST" && u.contains("/commit/main"))
        .expect("commit sent");
    let lines: Vec<&str> = commit.2.lines().collect();
    assert_eq!(lines.len(), 2);
    let lfs_line: serde_json::Value = serde_json::from_str(lines[1]).expect("lfsFile");
    assert_eq!(lfs_line["key"], "lfsFile");
    assert_eq!(lfs_line["value"]["path"], "docs/a.txt");
    assert_eq!(lfs_line["value"]["size"], 13);
}

/// Like `spawn_hub`, but the handler also receives the server's own base URL
/// so responses can point presigned targets back at the mock.
fn spawn_hub_self_aware<F>(handler: F) -> (String, RequestLog)
where
    F: Fn(&str, &str, &str, &str) -> Response<std::io::Cursor<Vec<u8>>> + Send + Sync + 'static,
{
    let server = Server::http("127.0.0.1:0").expect("server");
    let addr = format!("http://{}", server.server_addr());
    let own = addr.clone();
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
            let _ = request.respond(handler(&own, &method, &url, &body));
        }
    });
    (addr, log)
}

#[test]
fn upload_puts_to_presigned_url_then_commits() {
    let (addr3, log3) = spawn_hub_self_aware(|own, method, url, _| {
        if url.contains("/info/lfs/objects/batch") {
            json(&format!(
                r#"{{"objects": [{{"oid": "68e656b251e67e8358bef8483ab0d51c6619f3e7a1a9f0e75838d41ff368f728",
                     "size": 13,
                     "actions": {{"upload": {{"href": "{own}/s3-put"}}}}}}]}}"#
            ))
        } else if method == "PUT" && url == "/s3-put" {
            Response::from_string("")
        } else if method == "POST" && url.contains("/commit/main") {
            json(r#"{"success": true}"#)
        } else if url.contains("/refs") {
            refs_main()
        } else {
            public_repo_info()
        }
    });

    let driver = make_driver(&addr3, Some("hf_token"), "main");
    let cx = OpContext::new();
    driver
        .upload_file(
            &cx,
            "/docs/a.txt",
            ByteSource::from_bytes(b"hello, world!".to_vec()),
            &UploadOptions::default(),
        )
        .expect("upload");

    let log = log3.lock().expect("log");
    let put = log
        .iter()
        .find(|(m, u, _)| m == "PUT" && u == "/s3-put")
        .expect("PUT happened");
    assert_eq!(put.2, "hello, world!");
    assert!(log.iter().any(|(m, u, _)| m == "POST" && u.contains("/commit/main")));
}

#[test]
fn tag_revision_refuses_writes_before_any_lfs_call() {
    let (addr, log) = spawn_hub(|_, url, _| {
        if url.contains("/refs") {
            return refs_main();
        }
        public_repo_info()
    });

    let driver = make_driver(&addr, Some("hf_token"), "v1");
    let cx = OpContext::new();
    let err = driver
        .upload_file(
            &cx,
            "/a.txt",
            ByteSource::from_bytes(b"x".to_vec()),
            &UploadOptions::default(),
        )
        .expect_err("refused");
    assert_eq!(err.code(), ErrorCode::RevisionNotWritable);
    assert!(!log
        .lock()
        .expect("log")
        .iter()
        .any(|(_, u, _)| u.contains("lfs")));
}

#[test]
fn missing_token_refuses_writes() {
    let (addr, _log) = spawn_hub(|_, _, _| public_repo_info());
    let driver = make_driver(&addr, None, "main");
    let cx = OpContext::new();
    let err = driver
        .update_file(&cx, "/a.txt", b"hello")
        .expect_err("refused");
    assert_eq!(err.code(), ErrorCode::TokenRequiredForWrite);
}

#[test]
fn direct_links_respect_privacy() {
    let (addr, _log) = spawn_hub(|_, url, _| {
        if url == "/api/datasets/org/data" {
            return json(r#"{"private": true, "gated": false}"#);
        }
        public_repo_info()
    });
    let driver = make_driver(&addr, Some("hf_token"), "main");
    let cx = OpContext::new();
    let err = driver
        .generate_direct_link(&cx, "/x.csv", &Default::default())
        .expect_err("private");
    assert_eq!(err.code(), ErrorCode::DirectLinkNotAvailable);

    let proxy = driver.generate_proxy_link(&cx, "/x.csv").expect("proxy");
    assert_eq!(proxy.kind, LinkKind::Proxy);
}

#[test]
fn public_direct_link_uses_resolve_url() {
    let (addr, _log) = spawn_hub(|_, _, _| public_repo_info());
    let driver = make_driver(&addr, None, "main");
    let cx = OpContext::new();
    let link = driver
        .generate_direct_link(&cx, "/docs/a.txt", &Default::default())
        .expect("link");
    assert_eq!(link.kind, LinkKind::NativeDirect);
    assert_eq!(link.url, format!("{addr}/datasets/org/data/resolve/main/docs/a.txt"));
}

#[test]
fn download_streams_and_slices_ranges() {
    let (addr, _log) = spawn_hub(|method, url, _| {
        if method == "POST" && url.contains("/paths-info/main") {
            return json(r#"[{"path": "docs/a.txt", "type": "file", "size": 13}]"#);
        }
        if url.contains("/resolve/main/docs/a.txt") {
            // This server ignores Range and always answers 200.
            return Response::from_string("hello, world!");
        }
        public_repo_info()
    });

    let driver = make_driver(&addr, None, "main");
    let cx = OpContext::new();
    let descriptor = driver.download_file(&cx, "/docs/a.txt").expect("descriptor");
    assert_eq!(descriptor.size, Some(13));
    assert!(descriptor.supports_range);

    let full = descriptor
        .open_full(&cx.cancel)
        .expect("open")
        .read_all(&cx.cancel)
        .expect("read");
    assert_eq!(full, b"hello, world!");

    // Honor206 policy software-slices a 200 response.
    let sliced = descriptor
        .open_range(&cx.cancel, ByteRange::new(7, 11))
        .expect("open range")
        .read_all(&cx.cancel)
        .expect("read");
    assert_eq!(sliced, b"world");
}

#[test]
fn batch_remove_composes_one_commit_and_refuses_root() {
    let (addr, log) = spawn_hub(|method, url, _| {
        if method == "POST" && url.contains("/commit/main") {
            return json(r#"{"success": true}"#);
        }
        if url.contains("/refs") {
            return refs_main();
        }
        public_repo_info()
    });

    let driver = make_driver(&addr, Some("hf_token"), "main");
    let cx = OpContext::new();
    let paths = vec![
        "/docs/a.txt".to_string(),
        "/docs/a.txt".to_string(), // duplicate collapses
        "/old/".to_string(),
        "/".to_string(), // root refused
    ];
    let report = driver
        .batch_remove_items(&cx, &paths, &paths)
        .expect("remove");

    assert_eq!(report.success, vec!["/docs/a.txt", "/old/"]);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].error.contains("mount root"));

    let log = log.lock().expect("log");
    let commit = log
        .iter()
        .find(|(m, u, _)| m == "POST" && u.contains("/commit/main"))
        .expect("commit");
    let lines: Vec<serde_json::Value> = commit
        .2
        .lines()
        .map(|l| serde_json::from_str(l).expect("line"))
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1]["key"], "deletedFile");
    assert_eq!(lines[1]["value"]["path"], "docs/a.txt");
    assert_eq!(lines[2]["key"], "deletedFolder");
    assert_eq!(lines[2]["value"]["path"], "old");
}

#[test]
fn multipart_init_records_urls_and_validates_count() {
    let sessions = Arc::new(MemorySessionStore::new());
    let (addr, _log) = spawn_hub(|_, url, _| {
        if url.contains("/info/lfs/objects/batch") {
            return json(
                r#"{"objects": [{"oid": "deadbeef", "size": 10485760,
                     "actions": {"upload": {"href": "https://hub/complete",
                        "header": {"chunk_size": "5242880",
                                   "00001": "https://s3/p1?X-Amz-Expires=3600",
                                   "00002": "https://s3/p2?X-Amz-Expires=3600"}}}}]}"#,
            );
        }
        if url.contains("/refs") {
            return refs_main();
        }
        public_repo_info()
    });

    let driver = make_driver_with_sessions(&addr, Some("hf_token"), "main", Arc::clone(&sessions));
    let cx = OpContext::new();
    let outcome = driver
        .initialize_multipart_upload(
            &cx,
            &MultipartInitRequest {
                path: "/big.bin".to_string(),
                size: 10 * 1024 * 1024,
                filename: None,
                content_type: None,
                checksum: Some("deadbeef".to_string()),
            },
        )
        .expect("init");

    assert_eq!(outcome.mode, UploadMode::Multipart);
    assert_eq!(outcome.part_size, Some(5 * 1024 * 1024));
    assert_eq!(outcome.total_parts, Some(2));
    assert_eq!(outcome.presigned_urls.as_ref().map(Vec::len), Some(2));
    assert!(outcome.expires_at.is_some());

    // Sign with fresh URLs returns the cached set without a reset.
    let signed = driver
        .sign_multipart_parts(&cx, &outcome.session_id)
        .expect("sign");
    assert!(!signed.reset_uploaded_parts);
    assert_eq!(signed.presigned_urls.len(), 2);
}

#[test]
fn multipart_init_rejects_mismatched_part_urls() {
    let (addr, _log) = spawn_hub(|_, url, _| {
        if url.contains("/info/lfs/objects/batch") {
            // Two-part file, one URL offered.
            return json(
                r#"{"objects": [{"oid": "deadbeef", "size": 10485760,
                     "actions": {"upload": {"href": "https://hub/complete",
                        "header": {"chunk_size": "5242880",
                                   "00001": "https://s3/p1?X-Amz-Expires=3600"}}}}]}"#,
            );
        }
        if url.contains("/refs") {
            return refs_main();
        }
        public_repo_info()
    });

    let driver = make_driver(&addr, Some("hf_token"), "main");
    let cx = OpContext::new();
    let err = driver
        .initialize_multipart_upload(
            &cx,
            &MultipartInitRequest {
                path: "/big.bin".to_string(),
                size: 10 * 1024 * 1024,
                filename: None,
                content_type: None,
                checksum: Some("deadbeef".to_string()),
            },
        )
        .expect_err("mismatch");
    assert_eq!(err.code(), ErrorCode::MultipartPartsMismatch);
}

#[test]
fn multipart_complete_requires_etags_then_commits() {
    let sessions = Arc::new(MemorySessionStore::new());
    let (addr, log) = spawn_hub_self_aware(|own, method, url, _| {
        if url.contains("/info/lfs/objects/batch") {
            json(&format!(
                r#"{{"objects": [{{"oid": "deadbeef", "size": 10485760,
                     "actions": {{"upload": {{"href": "{own}/lfs-complete",
                        "header": {{"chunk_size": "5242880",
                                   "00001": "{own}/p1?X-Amz-Expires=3600",
                                   "00002": "{own}/p2?X-Amz-Expires=3600"}}}}}}}}]}}"#
            ))
        } else if url == "/lfs-complete" {
            json(r#"{"ok": true}"#)
        } else if method == "POST" && url.contains("/commit/main") {
            json(r#"{"success": true}"#)
        } else if url.contains("/refs") {
            refs_main()
        } else {
            public_repo_info()
        }
    });

    let driver = make_driver_with_sessions(&addr, Some("hf_token"), "main", sessions);
    let cx = OpContext::new();
    let outcome = driver
        .initialize_multipart_upload(
            &cx,
            &MultipartInitRequest {
                path: "/big.bin".to_string(),
                size: 10 * 1024 * 1024,
                filename: None,
                content_type: None,
                checksum: Some("deadbeef".to_string()),
            },
        )
        .expect("init");

    // Missing ETag is rejected before any network call.
    let err = driver
        .complete_multipart_upload(
            &cx,
            &outcome.session_id,
            &MultipartComplete {
                parts: vec![
                    PartInfo { part_number: 1, etag: Some("aa".to_string()), size: None },
                    PartInfo { part_number: 2, etag: None, size: None },
                ],
            },
        )
        .expect_err("missing etag");
    assert_eq!(err.code(), ErrorCode::MultipartPartsMismatch);

    let done = driver
        .complete_multipart_upload(
            &cx,
            &outcome.session_id,
            &MultipartComplete {
                parts: vec![
                    PartInfo { part_number: 1, etag: Some("aa".to_string()), size: None },
                    PartInfo { part_number: 2, etag: Some("bb".to_string()), size: None },
                ],
            },
        )
        .expect("complete");
    assert_eq!(done.storage_path, "/big.bin");

    let log = log.lock().expect("log");
    let completion = log
        .iter()
        .find(|(_, u, _)| u == "/lfs-complete")
        .expect("completion posted");
    let body: serde_json::Value = serde_json::from_str(&completion.2).expect("body");
    assert_eq!(body["oid"], "deadbeef");
    assert_eq!(body["parts"][0]["partNumber"], 1);
    assert_eq!(body["parts"][1]["etag"], "bb");
    assert!(log.iter().any(|(m, u, _)| m == "POST" && u.contains("/commit/main")));

    // The session is terminal now.
    let err = driver
        .abort_multipart_upload(&cx, &outcome.session_id)
        .err();
    assert!(err.is_none(), "abort of completed session is a store update");
}

#[test]
fn xet_flag_refuses_uploads_with_remediation() {
    let (addr, _log) = spawn_hub(|_, url, _| {
        if url.contains("/refs") {
            return refs_main();
        }
        public_repo_info()
    });

    let mut config = DriverConfig::new("hub", DriverKind::HubDataset)
        .with_endpoint(&addr)
        .with_credential("hf_token")
        .with_backend(serde_json::json!({"repo": "org/data", "revision": "main"}));
    config.options.use_xet = true;
    let mut driver = HubDriver::new(config, Arc::new(MemorySessionStore::new())).expect("driver");
    driver.initialize(None).expect("init");

    let cx = OpContext::new();
    let err = driver
        .upload_file(
            &cx,
            "/a.bin",
            ByteSource::from_bytes(b"x".to_vec()),
            &UploadOptions::default(),
        )
        .expect_err("xet refused");
    assert_eq!(err.code(), ErrorCode::WasmDisallowed);
    assert!(err.message().contains("use_xet"));
}

#[test]
fn path_traversal_is_rejected_everywhere() {
    let (addr, _log) = spawn_hub(|_, _, _| public_repo_info());
    let driver = make_driver(&addr, Some("hf_token"), "main");
    let cx = OpContext::new();

    let err = driver.stat(&cx, "/a/../b").expect_err("rejected");
    assert_eq!(err.code(), ErrorCode::DotsInPath);
    let err = driver
        .list_directory(&cx, "/../", &ListOptions::default())
        .expect_err("rejected");
    assert_eq!(err.code(), ErrorCode::DotsInPath);
}
