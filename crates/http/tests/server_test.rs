//! End-to-end tests over real TCP sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;

use vortex_http::handler::{make_callback, RequestCallback};
use vortex_http::protocol::HttpRequest;
use vortex_http::reactor::BoxError;
use vortex_http::server::{HttpServer, ServerOptions};

fn start_server(options: ServerOptions, callback: Arc<dyn RequestCallback>) -> SocketAddr {
    let server = HttpServer::with_options(callback, options).expect("create server");
    let address = server.bind(0).expect("bind");
    thread::spawn(move || server.start());
    address
}

fn respond(request: &HttpRequest, body: &[u8]) -> Result<(), BoxError> {
    let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
    request.write(head.as_bytes())?;
    request.write(body)?;
    request.finish()?;
    Ok(())
}

/// Answers every request with a plain-text description of what the server
/// saw: request line, remote ip, arguments, and uploaded files.
fn describe_callback() -> Arc<dyn RequestCallback> {
    Arc::new(make_callback(|request| {
        let mut lines = vec![
            format!("{} {}", request.method(), request.path()),
            format!("ip={}", request.remote_ip()),
        ];
        let mut names: Vec<_> = request.arguments().keys().cloned().collect();
        names.sort();
        for name in names {
            lines.push(format!("arg {name}={}", request.arguments()[&name].join(",")));
        }
        let mut names: Vec<_> = request.files().keys().cloned().collect();
        names.sort();
        for name in names {
            let file = &request.files()[&name];
            lines.push(format!(
                "file {name}={} {} {}b",
                file.filename,
                file.content_type,
                file.body.len()
            ));
        }
        respond(&request, lines.join("\n").as_bytes())
    }))
}

/// Reads one response, returning the head and the `Content-Length` body.
fn read_response(stream: &mut TcpStream) -> (String, String) {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).expect("response head");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).expect("head is utf-8");
    let content_length = head
        .lines()
        .find_map(|line| line.to_ascii_lowercase().strip_prefix("content-length:").map(str::to_owned))
        .expect("content-length header")
        .trim()
        .parse::<usize>()
        .expect("content-length value");
    let mut body = vec![0_u8; content_length];
    stream.read_exact(&mut body).expect("response body");
    (head, String::from_utf8_lossy(&body).into_owned())
}

#[test]
fn keep_alive_serves_requests_back_to_back() {
    let address = start_server(ServerOptions::default(), describe_callback());
    let mut stream = TcpStream::connect(address).expect("connect");

    stream.write_all(b"GET /alpha HTTP/1.1\r\nHost: x\r\n\r\n").expect("send");
    let (_, body) = read_response(&mut stream);
    assert!(body.starts_with("GET /alpha\n"), "body: {body}");

    stream.write_all(b"GET /beta HTTP/1.1\r\nHost: x\r\n\r\n").expect("send");
    let (_, body) = read_response(&mut stream);
    assert!(body.starts_with("GET /beta\n"), "body: {body}");

    stream
        .write_all(b"GET /last HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .expect("send");
    let (_, body) = read_response(&mut stream);
    assert!(body.starts_with("GET /last\n"), "body: {body}");

    let mut probe = [0_u8; 1];
    assert_eq!(stream.read(&mut probe).expect("eof"), 0);
}

#[test]
fn concurrent_connections_are_isolated() {
    let address = start_server(ServerOptions::default(), describe_callback());
    let mut first = TcpStream::connect(address).expect("connect");
    let mut second = TcpStream::connect(address).expect("connect");

    first.write_all(b"GET /one?who=a HTTP/1.1\r\nHost: x\r\n\r\n").expect("send");
    second.write_all(b"GET /two?who=b HTTP/1.1\r\nHost: x\r\n\r\n").expect("send");

    // read in the opposite order of sending
    let (_, body) = read_response(&mut second);
    assert!(body.starts_with("GET /two\n"), "body: {body}");
    assert!(body.contains("arg who=b"), "body: {body}");

    let (_, body) = read_response(&mut first);
    assert!(body.starts_with("GET /one\n"), "body: {body}");
    assert!(body.contains("arg who=a"), "body: {body}");
}

#[test]
fn urlencoded_post_body_lands_in_arguments() {
    let address = start_server(ServerOptions::default(), describe_callback());
    let mut stream = TcpStream::connect(address).expect("connect");

    let body = "name=bob&tag=a&tag=b";
    let request = format!(
        "POST /submit?name=alice HTTP/1.1\r\nHost: x\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).expect("send");

    let (_, body) = read_response(&mut stream);
    assert!(body.contains("arg name=alice,bob"), "body: {body}");
    assert!(body.contains("arg tag=a,b"), "body: {body}");
}

#[test]
fn multipart_post_body_lands_in_files() {
    let address = start_server(ServerOptions::default(), describe_callback());
    let mut stream = TcpStream::connect(address).expect("connect");

    let body = "--frontier\r\n\
                Content-Disposition: form-data; name=\"title\"\r\n\r\n\
                hello\r\n\
                --frontier\r\n\
                Content-Disposition: form-data; name=\"upload\"; filename=\"a.bin\"\r\n\
                Content-Type: application/octet-stream\r\n\r\n\
                12345\r\n\
                --frontier--\r\n";
    let request = format!(
        "POST /upload HTTP/1.1\r\nHost: x\r\n\
         Content-Type: multipart/form-data; boundary=frontier\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).expect("send");

    let (_, body) = read_response(&mut stream);
    assert!(body.contains("arg title=hello"), "body: {body}");
    assert!(body.contains("file upload=a.bin application/octet-stream 5b"), "body: {body}");
}

#[test]
fn binary_upload_sharing_a_packet_with_the_head_is_parsed() {
    let address = start_server(ServerOptions::default(), describe_callback());
    let mut stream = TcpStream::connect(address).expect("connect");

    let mut body = Vec::new();
    body.extend_from_slice(b"--frontier\r\n");
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"photo\"; filename=\"x.jpg\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    body.extend_from_slice(b"\xFF\xD8\xFF\xE0\x00\x10JFIF\r\n");
    body.extend_from_slice(b"--frontier--\r\n");

    let mut request = format!(
        "POST /upload HTTP/1.1\r\nHost: x\r\n\
         Content-Type: multipart/form-data; boundary=frontier\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);
    // head and non-UTF-8 body in a single write
    stream.write_all(&request).expect("send");

    let (_, body) = read_response(&mut stream);
    assert!(body.contains("file photo=x.jpg image/jpeg 10b"), "body: {body}");
}

#[test]
fn http_10_closes_after_the_response() {
    let address = start_server(ServerOptions::default(), describe_callback());
    let mut stream = TcpStream::connect(address).expect("connect");

    stream.write_all(b"GET /old HTTP/1.0\r\n\r\n").expect("send");
    let (_, body) = read_response(&mut stream);
    assert!(body.starts_with("GET /old\n"), "body: {body}");

    let mut probe = [0_u8; 1];
    assert_eq!(stream.read(&mut probe).expect("eof"), 0);
}

#[test]
fn expect_continue_gets_an_interim_response() {
    let address = start_server(ServerOptions::default(), describe_callback());
    let mut stream = TcpStream::connect(address).expect("connect");

    stream
        .write_all(
            b"POST /upload HTTP/1.1\r\nHost: x\r\n\
              Expect: 100-continue\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 8\r\n\r\n",
        )
        .expect("send head");

    let interim = b"HTTP/1.1 100 (Continue)\r\n\r\n";
    let mut buf = vec![0_u8; interim.len()];
    stream.read_exact(&mut buf).expect("interim response");
    assert_eq!(buf, interim);

    stream.write_all(b"name=bob").expect("send body");
    let (_, body) = read_response(&mut stream);
    assert!(body.contains("arg name=bob"), "body: {body}");
}

#[test]
fn oversized_content_length_drops_the_connection() {
    let address = start_server(
        ServerOptions::default().max_buffer_size(64),
        describe_callback(),
    );
    let mut stream = TcpStream::connect(address).expect("connect");

    stream
        .write_all(b"POST /big HTTP/1.1\r\nHost: x\r\nContent-Length: 999\r\n\r\n")
        .expect("send");

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).expect("connection closed");
    assert!(rest.is_empty(), "no response expected, got {rest:?}");
}

#[test]
fn xheaders_trusts_the_forwarded_ip() {
    let address = start_server(ServerOptions::default().xheaders(true), describe_callback());
    let mut stream = TcpStream::connect(address).expect("connect");

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nX-Real-Ip: 10.9.8.7\r\n\r\n")
        .expect("send");

    let (_, body) = read_response(&mut stream);
    assert!(body.contains("ip=10.9.8.7"), "body: {body}");

    // multi-hop X-Forwarded-For reports the last hop only
    let mut stream = TcpStream::connect(address).expect("connect");
    stream
        .write_all(
            b"GET / HTTP/1.1\r\nHost: x\r\nX-Forwarded-For: 203.0.113.7, 70.41.3.18\r\n\r\n",
        )
        .expect("send");

    let (_, body) = read_response(&mut stream);
    assert!(body.contains("ip=70.41.3.18"), "body: {body}");
}

#[test]
fn large_response_is_delivered_before_close() {
    let payload_len = 1 << 20;
    let callback = Arc::new(make_callback(move |request| {
        let body = vec![b'x'; payload_len];
        respond(&request, &body)
    }));
    let address = start_server(ServerOptions::default(), callback);
    let mut stream = TcpStream::connect(address).expect("connect");

    stream
        .write_all(b"GET /big HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .expect("send");

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert_eq!(body.len(), payload_len);
    assert!(body.bytes().all(|b| b == b'x'));

    let mut probe = [0_u8; 1];
    assert_eq!(stream.read(&mut probe).expect("eof"), 0);
}
