use etude_core::{Config, Server};
use std::fs::{self, File, Permissions};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::TempDir;

struct TestServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    _root: TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn write_file(root: &TempDir, name: &str, contents: &[u8], mode: u32) {
    let path = root.path().join(name);
    let mut f = File::create(&path).unwrap();
    f.write_all(contents).unwrap();
    fs::set_permissions(&path, Permissions::from_mode(mode)).unwrap();
}

fn setup_test_server(max_connections: usize) -> TestServer {
    let root = tempfile::tempdir().unwrap();
    write_file(&root, "index.html", b"<html><body>Hello, Etude!</body></html>", 0o644);
    write_file(&root, "empty.html", b"", 0o644);
    write_file(&root, "private.html", b"nope", 0o640);
    fs::create_dir(root.path().join("docs")).unwrap();
    fs::set_permissions(root.path().join("docs"), Permissions::from_mode(0o755)).unwrap();

    let big: Vec<u8> = (0..1_500_000u32).map(|i| (i % 251) as u8).collect();
    write_file(&root, "big.bin", &big, 0o644);

    let config = Config::default()
        .doc_root(root.path())
        .workers(2)
        .max_connections(max_connections);
    let server = Server::bind("127.0.0.1:0", config).unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();

    let handle = thread::spawn(move || {
        server.serve().unwrap();
    });

    TestServer {
        addr,
        shutdown,
        handle: Some(handle),
        _root: root,
    }
}

fn connect(server: &TestServer) -> TcpStream {
    let stream = TcpStream::connect(server.addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

/// One full request on a fresh connection, read until the server closes it.
fn request(server: &TestServer, raw: &[u8]) -> String {
    let mut stream = connect(server);
    stream.write_all(raw).unwrap();
    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    res
}

/// Read exactly one response off a persistent connection.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

#[test]
fn test_serves_file_contents() {
    let server = setup_test_server(64);

    let res = request(&server, b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.contains("Content-Length: 39\r\n"));
    assert!(res.contains("Connection: close\r\n"));
    assert!(res.ends_with("\r\n\r\n<html><body>Hello, Etude!</body></html>"));
}

#[test]
fn test_error_statuses() {
    let server = setup_test_server(64);

    let res = request(&server, b"GET /missing.html HTTP/1.1\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(res.ends_with("The requested file was not found on this server.\n"));

    let res = request(&server, b"GET /private.html HTTP/1.1\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 403 Forbidden\r\n"));

    let res = request(&server, b"GET /docs HTTP/1.1\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    let res = request(&server, b"POST /index.html HTTP/1.1\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    let res = request(&server, b"GET /index.html HTTP/1.0\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn test_empty_file_and_absolute_url() {
    let server = setup_test_server(64);

    let res = request(&server, b"GET /empty.html HTTP/1.1\r\n\r\n");
    assert!(res.contains("Content-Length: 26\r\n"));
    assert!(res.ends_with("<html><body></body></html>"));

    let res = request(&server, b"GET http://localhost:8080/index.html http/1.1\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let server = setup_test_server(64);
    let mut stream = connect(&server);

    for _ in 0..3 {
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert_eq!(body, b"<html><body>Hello, Etude!</body></html>");
    }

    // Without keep-alive the server closes after responding.
    stream.write_all(b"GET /empty.html HTTP/1.1\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.contains("Connection: close\r\n"));
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
}

#[test]
fn test_fragmented_request() {
    let server = setup_test_server(64);
    let mut stream = connect(&server);

    for part in [&b"GET /ind"[..], b"ex.html HT", b"TP/1.1\r", b"\nHost: x\r\n", b"\r\n"] {
        stream.write_all(part).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(30));
    }

    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.ends_with("Hello, Etude!</body></html>"));
}

#[test]
fn test_large_file_survives_partial_writes() {
    let server = setup_test_server(64);
    let mut stream = connect(&server);
    stream.write_all(b"GET /big.bin HTTP/1.1\r\n\r\n").unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Content-Length: 1500000\r\n"));
    assert_eq!(body.len(), 1_500_000);
    assert!(body.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));
}

#[test]
fn test_concurrent_clients_get_their_own_responses() {
    let server = setup_test_server(64);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let addr = server.addr;
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                let path = if i % 2 == 0 { "/index.html" } else { "/missing" };
                stream
                    .write_all(format!("GET {} HTTP/1.1\r\n\r\n", path).as_bytes())
                    .unwrap();
                let mut res = String::new();
                stream.read_to_string(&mut res).unwrap();
                (i, res)
            })
        })
        .collect();

    for handle in handles {
        let (i, res) = handle.join().unwrap();
        if i % 2 == 0 {
            assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "client {}: {}", i, res);
        } else {
            assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"), "client {}: {}", i, res);
        }
    }
}

#[test]
fn test_connection_over_capacity_is_told_busy() {
    let server = setup_test_server(2);

    let _a = connect(&server);
    let _b = connect(&server);
    thread::sleep(Duration::from_millis(100));

    // Sending nothing: unread request bytes would turn the close into a reset.
    let mut rejected = connect(&server);
    let mut res = String::new();
    rejected.read_to_string(&mut res).unwrap();
    assert_eq!(res, "Internal server busy");
}
