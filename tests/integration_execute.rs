use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use http::Uri;
use reqflow::{
    ConnectionHandle, CookieBuilder, DestinationPolicy, HttpClient, HttpError, MultipartEntity,
    Openable, RequestDescriptor, StaticResolver, StrictRedirects, UrlEncodedEntity,
};

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl MockResponse {
    fn new(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            body: body.into(),
        }
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

struct MockServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let served_clone = Arc::clone(&served);
        let captured_clone = Arc::clone(&captured);

        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut response_index = 0;

            while response_index < responses.len() && Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        if let Ok(request) = read_request(&mut stream) {
                            captured_clone
                                .lock()
                                .expect("lock captured requests")
                                .push(request);
                        }

                        served_clone.fetch_add(1, Ordering::SeqCst);
                        let response = &responses[response_index];
                        response_index += 1;
                        let _ = write_response(&mut stream, response);
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            captured,
            join: Some(join),
        }
    }

    fn uri(&self, path: &str) -> Uri {
        format!("{}{path}", self.base_url)
            .parse()
            .expect("mock server uri")
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        if find_header_end(&raw).is_some() {
            break;
        }
    }

    let header_end = find_header_end(&raw).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "malformed request without header terminator",
        )
    })?;

    let header_text = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "missing request line")
    })?;
    let mut request_line_parts = request_line.split_whitespace();
    let method = request_line_parts.next().unwrap_or_default().to_owned();
    let path = request_line_parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CapturedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let body = &response.body;
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        body.len()
    );
    for (name, value) in &response.headers {
        raw.push_str(name);
        raw.push_str(": ");
        raw.push_str(value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");

    stream.write_all(raw.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

fn quick_timeouts(builder: reqflow::RequestBuilder) -> reqflow::RequestBuilder {
    builder.timeouts(Duration::from_secs(2), Duration::from_secs(2))
}

#[test]
fn get_returns_body_and_sets_default_headers() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        vec![("Content-Type", "text/plain; charset=utf-8")],
        b"hello".to_vec(),
    )]);

    let client = HttpClient::new();
    let descriptor = quick_timeouts(RequestDescriptor::get(server.uri("/data")))
        .build()
        .expect("descriptor");
    let response = client.fetch(&descriptor).expect("fetch");
    assert_eq!(response.text(), "hello");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/data");
    assert_eq!(
        requests[0].headers.get("accept-encoding").map(String::as_str),
        Some("gzip")
    );
    assert!(requests[0]
        .headers
        .get("user-agent")
        .is_some_and(|value| value.starts_with("reqflow/")));
}

#[test]
fn relative_redirect_is_followed_as_get() {
    let server = MockServer::start(vec![
        MockResponse::new(302, vec![("Location", "/target")], Vec::new()),
        MockResponse::new(200, Vec::<(String, String)>::new(), b"after redirect".to_vec()),
    ]);

    let client = HttpClient::new();
    let entity = UrlEncodedEntity::new().with("field", "value");
    let descriptor = quick_timeouts(RequestDescriptor::post(server.uri("/x/y"), entity))
        .build()
        .expect("descriptor");
    let handle = ConnectionHandle::new();
    client.execute(&descriptor, &handle).expect("execute");
    let response = handle.read().expect("read");
    assert_eq!(response.text(), "after redirect");
    assert!(handle
        .redirected_uri()
        .is_some_and(|uri| uri.path() == "/target"));

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, "POST");
    // Browser-style handling switches to GET and drops the body.
    assert_eq!(requests[1].method, "GET");
    assert_eq!(requests[1].path, "/target");
    assert!(requests[1].body.is_empty());
}

#[test]
fn strict_handler_retransmits_post_body_on_302() {
    let server = MockServer::start(vec![
        MockResponse::new(302, vec![("Location", "/retry")], Vec::new()),
        MockResponse::new(200, Vec::<(String, String)>::new(), b"done".to_vec()),
    ]);

    let client = HttpClient::new();
    let entity = UrlEncodedEntity::new().with("token", "abc123");
    let descriptor = quick_timeouts(RequestDescriptor::post(server.uri("/submit"), entity))
        .redirect_handler(StrictRedirects)
        .build()
        .expect("descriptor");
    let response = client.fetch(&descriptor).expect("fetch");
    assert_eq!(response.text(), "done");

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].method, "POST");
    assert_eq!(requests[1].body, b"token=abc123".to_vec());
    assert_eq!(
        requests[1].headers.get("content-type").map(String::as_str),
        Some("application/x-www-form-urlencoded")
    );
}

#[test]
fn strict_handler_switches_to_get_on_307() {
    let server = MockServer::start(vec![
        MockResponse::new(307, vec![("Location", "/next")], Vec::new()),
        MockResponse::new(200, Vec::<(String, String)>::new(), b"done".to_vec()),
    ]);

    let client = HttpClient::new();
    let entity = UrlEncodedEntity::new().with("token", "abc123");
    let descriptor = quick_timeouts(RequestDescriptor::post(server.uri("/submit"), entity))
        .redirect_handler(StrictRedirects)
        .build()
        .expect("descriptor");
    client.fetch(&descriptor).expect("fetch");

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].method, "GET");
    assert!(requests[1].body.is_empty());
}

struct MemoryFile {
    bytes: Vec<u8>,
}

impl Openable for MemoryFile {
    fn file_name(&self) -> &str {
        "upload.bin"
    }

    fn mime_type(&self) -> &str {
        "application/octet-stream"
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::io::Cursor::new(self.bytes.clone())))
    }
}

#[test]
fn multipart_post_sends_exactly_the_declared_length() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        Vec::<(String, String)>::new(),
        b"ok".to_vec(),
    )]);

    let entity = MultipartEntity::new()
        .with_text("comment", "привет")
        .with_openable(
            "file",
            Arc::new(MemoryFile {
                bytes: vec![0x5A; 2048],
            }) as Arc<dyn Openable>,
        );
    let declared = reqflow::Entity::from(entity.clone()).content_length();

    let client = HttpClient::new();
    let descriptor = quick_timeouts(RequestDescriptor::post(server.uri("/upload"), entity))
        .build()
        .expect("descriptor");
    client.fetch(&descriptor).expect("fetch");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body.len() as u64, declared);
    assert_eq!(
        requests[0]
            .headers
            .get("content-length")
            .map(String::as_str),
        Some(declared.to_string().as_str())
    );
    let body_text = String::from_utf8_lossy(&requests[0].body);
    assert!(body_text.contains("name=\"comment\""));
    assert!(body_text.contains("filename=\"upload.bin\""));
    assert!(requests[0]
        .headers
        .get("content-type")
        .is_some_and(|value| value.starts_with("multipart/form-data; boundary=")));
}

#[test]
fn head_fetch_returns_empty_response_without_a_body_read() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        vec![("Content-Type", "text/plain")],
        Vec::new(),
    )]);

    let client = HttpClient::new();
    let descriptor = quick_timeouts(RequestDescriptor::head(server.uri("/probe")))
        .build()
        .expect("descriptor");
    let response = client.fetch(&descriptor).expect("fetch");
    assert!(response.is_empty());

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "HEAD");
}

#[test]
fn gzip_response_is_transparently_decoded() {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(b"compressed payload")
        .expect("gzip write");
    let compressed = encoder.finish().expect("gzip finish");

    let server = MockServer::start(vec![MockResponse::new(
        200,
        vec![("Content-Encoding", "gzip")],
        compressed,
    )]);

    let client = HttpClient::new();
    let descriptor = quick_timeouts(RequestDescriptor::get(server.uri("/archive")))
        .build()
        .expect("descriptor");
    let response = client.fetch(&descriptor).expect("fetch");
    assert_eq!(response.text(), "compressed payload");
}

#[test]
fn validator_is_extracted_and_not_modified_is_distinguished() {
    let server = MockServer::start(vec![
        MockResponse::new(200, vec![("ETag", "\"v1\"")], b"fresh".to_vec()),
        MockResponse::new(304, Vec::<(String, String)>::new(), Vec::new()),
    ]);

    let client = HttpClient::new();
    let handle = ConnectionHandle::new();
    let descriptor = quick_timeouts(RequestDescriptor::get(server.uri("/page")))
        .build()
        .expect("descriptor");
    client.execute(&descriptor, &handle).expect("execute");
    handle.read().expect("read");
    let validator = handle.validator().expect("validator");
    assert_eq!(validator.etag(), Some("\"v1\""));

    let conditional = quick_timeouts(RequestDescriptor::get(server.uri("/page")))
        .validator(validator)
        .build()
        .expect("descriptor");
    let error = client
        .fetch(&conditional)
        .expect_err("not modified should short-circuit");
    assert!(error.is_not_modified());

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[1]
            .headers
            .get("if-none-match")
            .map(String::as_str),
        Some("\"v1\"")
    );
}

#[test]
fn success_only_surfaces_status_error_but_error_bodies_stay_readable() {
    let server = MockServer::start(vec![
        MockResponse::new(404, Vec::<(String, String)>::new(), b"missing".to_vec()),
        MockResponse::new(404, Vec::<(String, String)>::new(), b"missing".to_vec()),
    ]);

    let client = HttpClient::new();
    let strict = quick_timeouts(RequestDescriptor::get(server.uri("/absent")))
        .build()
        .expect("descriptor");
    let error = client.fetch(&strict).expect_err("404 should fail");
    match &error {
        HttpError::HttpStatus { status, message } => {
            assert_eq!(*status, 404);
            assert_eq!(message, "Not Found");
        }
        other => panic!("unexpected error: {other}"),
    }

    let lenient = quick_timeouts(RequestDescriptor::get(server.uri("/absent")))
        .success_only(false)
        .build()
        .expect("descriptor");
    let handle = ConnectionHandle::new();
    client.execute(&lenient, &handle).expect("execute");
    assert_eq!(handle.status(), Some(http::StatusCode::NOT_FOUND));
    let response = handle.read().expect("read error body");
    assert_eq!(response.text(), "missing");
}

#[test]
fn attempt_budget_bounds_connection_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind resetting server");
    let address = listener.local_addr().expect("local address");
    listener
        .set_nonblocking(true)
        .expect("set listener nonblocking");
    let attempts = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let attempts_clone = Arc::clone(&attempts);
    let stop_clone = Arc::clone(&stop);
    let join = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !stop_clone.load(Ordering::SeqCst) && Instant::now() < deadline {
            match listener.accept() {
                Ok((stream, _)) => {
                    attempts_clone.fetch_add(1, Ordering::SeqCst);
                    // Closing without a response resets the client.
                    drop(stream);
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(2));
                }
                Err(_) => break,
            }
        }
    });

    let client = HttpClient::new();
    let uri: Uri = format!("http://{address}/flaky").parse().expect("uri");
    let descriptor = quick_timeouts(RequestDescriptor::get(uri))
        .build()
        .expect("descriptor");
    let error = client
        .fetch(&descriptor)
        .expect_err("always-resetting server should exhaust the budget");
    assert!(error.is_retryable(), "unexpected error: {error}");

    stop.store(true, Ordering::SeqCst);
    join.join().expect("server thread");
    assert_eq!(attempts.load(Ordering::SeqCst), 10);
}

#[test]
fn disconnect_from_another_thread_cancels_an_in_flight_read() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind slow server");
    let address = listener.local_addr().expect("local address");
    let stop = Arc::new(AtomicBool::new(false));

    let stop_clone = Arc::clone(&stop);
    let join = thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let _ = read_request(&mut stream);
        let _ = stream.write_all(
            b"HTTP/1.1 200 OK\r\nContent-Length: 10000000\r\nConnection: close\r\n\r\n",
        );
        let chunk = [0x61_u8; 512];
        while !stop_clone.load(Ordering::SeqCst) {
            if stream.write_all(&chunk).is_err() {
                break;
            }
            let _ = stream.flush();
            thread::sleep(Duration::from_millis(20));
        }
    });

    let client = Arc::new(HttpClient::new());
    let handle = Arc::new(ConnectionHandle::new());
    let uri: Uri = format!("http://{address}/slow").parse().expect("uri");
    let descriptor = quick_timeouts(RequestDescriptor::get(uri))
        .build()
        .expect("descriptor");
    client.execute(&descriptor, &handle).expect("execute");

    let reader_handle = Arc::clone(&handle);
    let reader = thread::spawn(move || reader_handle.read());
    thread::sleep(Duration::from_millis(100));
    handle.disconnect();

    let outcome = reader.join().expect("reader thread");
    let error = outcome.expect_err("read should observe the disconnect");
    assert!(error.is_cancelled(), "unexpected error: {error}");

    stop.store(true, Ordering::SeqCst);
    join.join().expect("server thread");
}

#[test]
fn single_connection_destination_never_overlaps_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind server");
    let address = listener.local_addr().expect("local address");
    listener
        .set_nonblocking(true)
        .expect("set listener nonblocking");
    let overlap = Arc::new(AtomicBool::new(false));

    let overlap_clone = Arc::clone(&overlap);
    let join = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut served = 0;
        while served < 2 && Instant::now() < deadline {
            match listener.accept() {
                Ok((mut stream, _)) => {
                    let _ = read_request(&mut stream);
                    if served == 0 {
                        // Hold the first connection open; a second connect
                        // arriving now means the slot was not honored.
                        let hold_until = Instant::now() + Duration::from_millis(150);
                        while Instant::now() < hold_until {
                            if listener.accept().is_ok() {
                                overlap_clone.store(true, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_millis(5));
                        }
                    }
                    let _ = write_response(
                        &mut stream,
                        &MockResponse::new(200, Vec::<(String, String)>::new(), b"ok".to_vec()),
                    );
                    served += 1;
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(_) => break,
            }
        }
    });

    let resolver = StaticResolver::new().with_policy(
        "127.0.0.1",
        DestinationPolicy {
            proxy: None,
            verify_tls: true,
            single_connection: true,
        },
    );
    let client = Arc::new(HttpClient::builder().resolver(resolver).build());
    let uri: Uri = format!("http://{address}/shared").parse().expect("uri");

    let mut workers = Vec::new();
    for _ in 0..2 {
        let client = Arc::clone(&client);
        let uri = uri.clone();
        workers.push(thread::spawn(move || {
            let descriptor = quick_timeouts(RequestDescriptor::get(uri))
                .build()
                .expect("descriptor");
            client.fetch(&descriptor).map(|response| response.text())
        }));
    }
    for worker in workers {
        let body = worker.join().expect("worker").expect("fetch");
        assert_eq!(body, "ok");
    }

    join.join().expect("server thread");
    assert!(!overlap.load(Ordering::SeqCst), "connections overlapped");
}

#[test]
fn cookie_header_combines_builder_and_destination_cookie() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        Vec::<(String, String)>::new(),
        b"ok".to_vec(),
    )]);

    let resolver = StaticResolver::new().with_cookie("127.0.0.1", "access", "token");
    let client = HttpClient::builder().resolver(resolver).build();
    let descriptor = quick_timeouts(RequestDescriptor::get(server.uri("/page")))
        .cookies(CookieBuilder::new().with("session", "abc"))
        .build()
        .expect("descriptor");
    client.fetch(&descriptor).expect("fetch");

    let requests = server.requests();
    assert_eq!(
        requests[0].headers.get("cookie").map(String::as_str),
        Some("session=abc; access=token")
    );
}

#[test]
fn per_host_delay_spaces_sequential_requests() {
    let server = MockServer::start(vec![
        MockResponse::new(200, Vec::<(String, String)>::new(), b"one".to_vec()),
        MockResponse::new(200, Vec::<(String, String)>::new(), b"two".to_vec()),
    ]);

    let client = HttpClient::new();
    let delay = Duration::from_millis(80);
    let started = Instant::now();
    for _ in 0..2 {
        let descriptor = quick_timeouts(RequestDescriptor::get(server.uri("/spaced")))
            .delay(delay)
            .build()
            .expect("descriptor");
        client.fetch(&descriptor).expect("fetch");
    }
    assert!(started.elapsed() >= delay * 2);
    assert_eq!(server.served_count(), 2);
}
