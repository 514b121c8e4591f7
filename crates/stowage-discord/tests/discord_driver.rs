//! Driver tests against a mock chat API and CDN.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tiny_http::{Header, Response, Server};

use stowage_core::{
    ByteRange, ByteSource, MultipartComplete, MultipartInitRequest, OpContext, StorageDriver,
};
use stowage_discord::{DiscordDriver, MemoryNodeStore, NodeStore, VfsNode};
use stowage_sessions::MemorySessionStore;
use stowage_types::{
    Capability, DriverConfig, DriverKind, ErrorCode, ListOptions, UploadOptions,
};

type RequestLog = Arc<Mutex<Vec<(String, String)>>>;
type BlobMap = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Crude multipart parse: the `files[0]` part body sits between its blank
/// line and the next boundary. Test payloads are ASCII.
fn extract_upload(body: &str) -> Vec<u8> {
    let idx = body.find("name=\"files[0]\"").expect("file part");
    let rest = &body[idx..];
    let start = rest.find("\r\n\r\n").expect("part body") + 4;
    let rest = &rest[start..];
    let end = rest.find("\r\n--").unwrap_or(rest.len());
    rest[..end].as_bytes().to_vec()
}

/// Mock chat backend: message posts store attachment bytes; `/cdn/…` serves
/// them while deliberately ignoring Range headers (always 200).
fn spawn_chat() -> (String, RequestLog, BlobMap) {
    let server = Server::http("127.0.0.1:0").expect("server");
    let addr = format!("http://{}", server.server_addr());
    let own = addr.clone();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let blobs: BlobMap = Arc::new(Mutex::new(HashMap::new()));
    let log_in = Arc::clone(&log);
    let blobs_in = Arc::clone(&blobs);
    let counter = AtomicU32::new(0);

    std::thread::spawn(move || {
        for mut request in server.incoming_requests() {
            let mut body = String::new();
            let _ = request.as_reader().read_to_string(&mut body);
            let method = request.method().as_str().to_string();
            let url = request.url().to_string();
            log_in.lock().expect("log").push((method.clone(), url.clone()));

            let response = if method == "POST" && url == "/channels/chan1/messages" {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let bytes = extract_upload(&body);
                let size = bytes.len();
                blobs_in.lock().expect("blobs").insert(format!("att{n}"), bytes);
                Response::from_string(format!(
                    r#"{{"id": "msg{n}", "channel_id": "chan1",
                        "attachments": [{{"id": "att{n}", "url": "{own}/cdn/att{n}",
                                          "size": {size},
                                          "content_type": "application/octet-stream"}}]}}"#
                ))
                .with_header(Header::from_bytes("Content-Type", "application/json").expect("header"))
            } else if method == "GET" && url.starts_with("/channels/chan1/messages/msg") {
                let n: u32 = url.rsplit("msg").next().and_then(|s| s.parse().ok()).expect("msg id");
                let size = blobs_in
                    .lock()
                    .expect("blobs")
                    .get(&format!("att{n}"))
                    .map(Vec::len)
                    .unwrap_or(0);
                Response::from_string(format!(
                    r#"{{"id": "msg{n}", "channel_id": "chan1",
                        "attachments": [{{"id": "att{n}", "url": "{own}/cdn/att{n}",
                                          "size": {size},
                                          "content_type": "application/octet-stream"}}]}}"#
                ))
                .with_header(Header::from_bytes("Content-Type", "application/json").expect("header"))
            } else if method == "GET" && url.starts_with("/cdn/") {
                let id = url.trim_start_matches("/cdn/").to_string();
                match blobs_in.lock().expect("blobs").get(&id) {
                    // Range headers are ignored on purpose: the driver must
                    // software-slice 200 responses.
                    Some(bytes) => Response::from_data(bytes.clone()),
                    None => Response::from_string("gone").with_status_code(404),
                }
            } else if method == "GET" && url.starts_with("/dead/") {
                Response::from_string("expired").with_status_code(404)
            } else {
                Response::from_string("not found").with_status_code(404)
            };
            let _ = request.respond(response);
        }
    });
    (addr, log, blobs)
}

fn make_driver(
    addr: &str,
    nodes: Arc<MemoryNodeStore>,
    sessions: Arc<MemorySessionStore>,
) -> DiscordDriver {
    let mut config = DriverConfig::new("chat", DriverKind::MessageAttachment)
        .with_endpoint(addr)
        .with_credential("bot-token")
        .with_backend(serde_json::json!({"channel_id": "chan1", "admin_id": "admin"}));
    config.options.part_size = Some(6);
    let mut driver = DiscordDriver::new(config, nodes, sessions).expect("driver");
    driver.initialize(None).expect("initialize");
    driver
}

#[test]
fn capabilities_follow_token() {
    let (addr, _log, _blobs) = spawn_chat();
    let driver = make_driver(&addr, Arc::new(MemoryNodeStore::new()), Arc::new(MemorySessionStore::new()));
    assert!(driver.capabilities().contains(Capability::Writer));
    assert!(driver.capabilities().contains(Capability::Search));
    assert!(!driver.capabilities().contains(Capability::DirectLink));
}

#[test]
fn upload_posts_one_message_and_indexes_it() {
    let (addr, log, blobs) = spawn_chat();
    let nodes = Arc::new(MemoryNodeStore::new());
    let driver = make_driver(&addr, Arc::clone(&nodes), Arc::new(MemorySessionStore::new()));
    let cx = OpContext::new();

    let outcome = driver
        .upload_file(
            &cx,
            "/docs/report.txt",
            ByteSource::from_bytes(b"quarterly numbers".to_vec()),
            &UploadOptions::default(),
        )
        .expect("upload");
    assert_eq!(outcome.storage_path, "/docs/report.txt");

    let posts = log
        .lock()
        .expect("log")
        .iter()
        .filter(|(m, u)| m == "POST" && u == "/channels/chan1/messages")
        .count();
    assert_eq!(posts, 1);
    assert_eq!(
        blobs.lock().expect("blobs").get("att1").expect("stored"),
        b"quarterly numbers"
    );

    let listing = driver
        .list_directory(&cx, "/docs/", &ListOptions::default())
        .expect("list");
    assert_eq!(listing.items.len(), 1);
    assert_eq!(listing.items[0].name, "report.txt");
    assert_eq!(listing.items[0].size, Some(17));

    let stat = driver.stat(&cx, "/docs/report.txt").expect("stat");
    assert!(!stat.is_directory);
}

#[test]
fn failed_index_write_warns_against_reupload() {
    struct BrokenStore;

    impl NodeStore for BrokenStore {
        fn get(&self, _: &str, _: &str, _: &str) -> anyhow::Result<Option<VfsNode>> {
            Ok(None)
        }
        fn lookup(
            &self,
            _: &str,
            _: &str,
            _: Option<&str>,
            _: &str,
        ) -> anyhow::Result<Option<VfsNode>> {
            Ok(None)
        }
        fn children(&self, _: &str, _: &str, _: Option<&str>) -> anyhow::Result<Vec<VfsNode>> {
            Ok(Vec::new())
        }
        fn insert(&self, _: VfsNode) -> anyhow::Result<()> {
            anyhow::bail!("index database is down")
        }
        fn update(&self, _: &VfsNode) -> anyhow::Result<()> {
            anyhow::bail!("index database is down")
        }
        fn remove(&self, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("index database is down")
        }
        fn search(&self, _: &str, _: &str, _: &str) -> anyhow::Result<Vec<VfsNode>> {
            Ok(Vec::new())
        }
    }

    let (addr, log, _blobs) = spawn_chat();
    let mut config = DriverConfig::new("chat", DriverKind::MessageAttachment)
        .with_endpoint(&addr)
        .with_credential("bot-token")
        .with_backend(serde_json::json!({"channel_id": "chan1"}));
    config.options.part_size = Some(6);
    let mut driver = DiscordDriver::new(
        config,
        Arc::new(BrokenStore),
        Arc::new(MemorySessionStore::new()),
    )
    .expect("driver");
    driver.initialize(None).expect("initialize");

    let cx = OpContext::new();
    let err = driver
        .upload_file(
            &cx,
            "/orphan.bin",
            ByteSource::from_bytes(b"bytes".to_vec()),
            &UploadOptions::default(),
        )
        .expect_err("index failed");

    assert_eq!(err.code(), ErrorCode::DiscordIndexWriteFailed);
    assert!(err.message().contains("Do NOT re-upload"));
    assert!(!err.is_retryable());

    // The message send itself happened exactly once.
    let posts = log
        .lock()
        .expect("log")
        .iter()
        .filter(|(m, u)| m == "POST" && u == "/channels/chan1/messages")
        .count();
    assert_eq!(posts, 1);
}

#[test]
fn download_refreshes_expired_attachment_urls() {
    let (addr, log, blobs) = spawn_chat();
    blobs
        .lock()
        .expect("blobs")
        .insert("att7".to_string(), b"refreshed content".to_vec());

    let nodes = Arc::new(MemoryNodeStore::new());
    // Node whose cached URL is dead; the driver must re-read the message.
    nodes
        .insert(VfsNode::new_file(
            "admin",
            "chan1",
            None,
            "old.bin",
            "application/octet-stream".to_string(),
            Some(17),
            serde_json::json!({
                "kind": "discord_attachment_v1",
                "channel_id": "chan1",
                "message_id": "msg7",
                "attachment_id": "att7",
                "url": format!("{addr}/dead/att7"),
                "size": 17
            }),
        ))
        .expect("seed node");

    let driver = make_driver(&addr, nodes, Arc::new(MemorySessionStore::new()));
    let cx = OpContext::new();
    let descriptor = driver.download_file(&cx, "/old.bin").expect("descriptor");
    let bytes = descriptor
        .open_full(&cx.cancel)
        .expect("open")
        .read_all(&cx.cancel)
        .expect("read");
    assert_eq!(bytes, b"refreshed content");
    assert!(log
        .lock()
        .expect("log")
        .iter()
        .any(|(m, u)| m == "GET" && u == "/channels/chan1/messages/msg7"));
}

#[test]
fn chunked_ranges_are_byte_correct_even_on_200_responses() {
    let (addr, _log, blobs) = spawn_chat();
    {
        let mut blobs = blobs.lock().expect("blobs");
        blobs.insert("att1".to_string(), b"AAAAA".to_vec());
        blobs.insert("att2".to_string(), b"BBBBB".to_vec());
        blobs.insert("att3".to_string(), b"CCCCC".to_vec());
    }

    let nodes = Arc::new(MemoryNodeStore::new());
    let parts: Vec<serde_json::Value> = (1..=3)
        .map(|n| {
            serde_json::json!({
                "part_no": n, "size": 5,
                "message_id": format!("msg{n}"), "attachment_id": format!("att{n}"),
                "url": format!("{addr}/cdn/att{n}"), "channel_id": "chan1"
            })
        })
        .collect();
    nodes
        .insert(VfsNode::new_file(
            "admin",
            "chan1",
            None,
            "big.bin",
            "application/octet-stream".to_string(),
            Some(15),
            serde_json::json!({"kind": "discord_chunks_v1", "parts": parts}),
        ))
        .expect("seed node");

    let driver = make_driver(&addr, nodes, Arc::new(MemorySessionStore::new()));
    let cx = OpContext::new();
    let descriptor = driver.download_file(&cx, "/big.bin").expect("descriptor");
    assert_eq!(descriptor.size, Some(15));
    assert!(descriptor.supports_range);

    let full = descriptor
        .open_full(&cx.cancel)
        .expect("open")
        .read_all(&cx.cancel)
        .expect("read");
    assert_eq!(full, b"AAAAABBBBBCCCCC");

    // Straddles the part 1/part 2 boundary; the CDN answers 200, so every
    // part read is software-sliced.
    let straddle = descriptor
        .open_range(&cx.cancel, ByteRange::new(3, 7))
        .expect("open range")
        .read_all(&cx.cancel)
        .expect("read");
    assert_eq!(straddle, b"AABBB");

    let tail = descriptor
        .open_range(&cx.cancel, ByteRange::from(12))
        .expect("open range")
        .read_all(&cx.cancel)
        .expect("read");
    assert_eq!(tail, b"CCC");
}

#[test]
fn throttled_downloads_wait_on_the_body_hint_not_the_header() {
    // The backend sends a rounded Retry-After header next to the fractional
    // body value; waiting on the header here would stall for 30 seconds.
    let hits = Arc::new(AtomicU32::new(0));
    let hits_in = Arc::clone(&hits);
    let server = Server::http("127.0.0.1:0").expect("server");
    let addr = format!("http://{}", server.server_addr());
    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            let n = hits_in.fetch_add(1, Ordering::SeqCst) + 1;
            let response = if n == 1 {
                Response::from_string(r#"{"retry_after": 0.05}"#)
                    .with_status_code(429)
                    .with_header(Header::from_bytes("Retry-After", "30").expect("header"))
            } else {
                Response::from_string("throttled content")
            };
            let _ = request.respond(response);
        }
    });

    let nodes = Arc::new(MemoryNodeStore::new());
    nodes
        .insert(VfsNode::new_file(
            "admin",
            "chan1",
            None,
            "hot.bin",
            "application/octet-stream".to_string(),
            Some(17),
            serde_json::json!({
                "kind": "discord_attachment_v1",
                "channel_id": "chan1",
                "message_id": "msg1",
                "attachment_id": "att1",
                "url": format!("{addr}/cdn/att1"),
                "size": 17
            }),
        ))
        .expect("seed node");

    let driver = make_driver(&addr, nodes, Arc::new(MemorySessionStore::new()));
    let cx = OpContext::new();
    let started = std::time::Instant::now();
    let bytes = driver
        .download_file(&cx, "/hot.bin")
        .expect("descriptor")
        .open_full(&cx.cancel)
        .expect("open")
        .read_all(&cx.cancel)
        .expect("read");
    assert_eq!(bytes, b"throttled content");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(
        started.elapsed() < std::time::Duration::from_secs(10),
        "retry waited on the header, not the body"
    );
}

#[test]
fn proxied_multipart_promotes_chunks_to_a_node() {
    let (addr, _log, blobs) = spawn_chat();
    let nodes = Arc::new(MemoryNodeStore::new());
    let sessions = Arc::new(MemorySessionStore::new());
    let driver = make_driver(&addr, Arc::clone(&nodes), Arc::clone(&sessions));
    let cx = OpContext::new();

    let init = driver
        .initialize_multipart_upload(
            &cx,
            &MultipartInitRequest {
                path: "/media/clip.bin".to_string(),
                size: 11,
                filename: Some("clip.bin".to_string()),
                content_type: None,
                checksum: None,
            },
        )
        .expect("init");
    assert_eq!(init.total_parts, Some(2));
    assert_eq!(init.part_size, Some(6));

    driver
        .proxy_multipart_chunk(&cx, &init.session_id, 1, ByteSource::from_bytes(b"hello ".to_vec()))
        .expect("chunk 1");
    driver
        .proxy_multipart_chunk(&cx, &init.session_id, 2, ByteSource::from_bytes(b"world".to_vec()))
        .expect("chunk 2");

    let parts = driver
        .list_multipart_parts(&cx, &init.session_id)
        .expect("parts");
    assert_eq!(parts.len(), 2);

    let done = driver
        .complete_multipart_upload(&cx, &init.session_id, &MultipartComplete { parts: vec![] })
        .expect("complete");
    assert_eq!(done.storage_path, "/media/clip.bin");

    // Both chunks landed as attachments.
    assert_eq!(blobs.lock().expect("blobs").len(), 2);

    // The promoted node reads back byte-identical.
    let descriptor = driver.download_file(&cx, "/media/clip.bin").expect("descriptor");
    assert_eq!(descriptor.size, Some(11));
    let bytes = descriptor
        .open_full(&cx.cancel)
        .expect("open")
        .read_all(&cx.cancel)
        .expect("read");
    assert_eq!(bytes, b"hello world");

    // Completing twice is refused: the session is terminal.
    let err = driver
        .complete_multipart_upload(&cx, &init.session_id, &MultipartComplete { parts: vec![] })
        .expect_err("terminal");
    assert_eq!(err.code(), ErrorCode::InvalidConfig);
}

#[test]
fn incomplete_sessions_refuse_completion() {
    let (addr, _log, _blobs) = spawn_chat();
    let driver = make_driver(
        &addr,
        Arc::new(MemoryNodeStore::new()),
        Arc::new(MemorySessionStore::new()),
    );
    let cx = OpContext::new();

    let init = driver
        .initialize_multipart_upload(
            &cx,
            &MultipartInitRequest {
                path: "/partial.bin".to_string(),
                size: 11,
                filename: None,
                content_type: None,
                checksum: None,
            },
        )
        .expect("init");
    driver
        .proxy_multipart_chunk(&cx, &init.session_id, 1, ByteSource::from_bytes(b"hello ".to_vec()))
        .expect("chunk 1");

    let err = driver
        .complete_multipart_upload(&cx, &init.session_id, &MultipartComplete { parts: vec![] })
        .expect_err("incomplete");
    assert_eq!(err.code(), ErrorCode::MultipartPartsMismatch);

    driver
        .abort_multipart_upload(&cx, &init.session_id)
        .expect("abort");
}

#[test]
fn mutations_touch_only_the_index() {
    let (addr, log, _blobs) = spawn_chat();
    let nodes = Arc::new(MemoryNodeStore::new());
    let driver = make_driver(&addr, Arc::clone(&nodes), Arc::new(MemorySessionStore::new()));
    let cx = OpContext::new();

    driver
        .upload_file(
            &cx,
            "/a/file.txt",
            ByteSource::from_bytes(b"content".to_vec()),
            &UploadOptions::default(),
        )
        .expect("upload");
    let api_calls_after_upload = log.lock().expect("log").len();

    driver.rename_item(&cx, "/a/file.txt", "/b/file2.txt").expect("rename");
    driver
        .copy_item(&cx, "/b/file2.txt", "/b/copy.txt", &Default::default())
        .expect("copy");
    let paths = vec!["/b/copy.txt".to_string(), "/b/copy.txt".to_string(), "/".to_string()];
    let report = driver
        .batch_remove_items(&cx, &paths, &paths)
        .expect("remove");
    assert_eq!(report.success, vec!["/b/copy.txt"]);
    assert_eq!(report.failed.len(), 1);

    // None of those operations called the message API.
    assert_eq!(log.lock().expect("log").len(), api_calls_after_upload);

    // The rename target still resolves to the original content ref.
    let stat = driver.stat(&cx, "/b/file2.txt").expect("stat");
    assert_eq!(stat.size, Some(7));

    let hits = driver.search(&cx, "FILE2").expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "/b/file2.txt");
}

#[test]
fn create_directory_is_idempotent() {
    let (addr, _log, _blobs) = spawn_chat();
    let driver = make_driver(
        &addr,
        Arc::new(MemoryNodeStore::new()),
        Arc::new(MemorySessionStore::new()),
    );
    let cx = OpContext::new();

    let first = driver.create_directory(&cx, "/inbox/").expect("create");
    assert!(!first.already_existed);
    let second = driver.create_directory(&cx, "/inbox/").expect("create again");
    assert!(second.already_existed);
}
