use std::collections::HashMap;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use vortex_http::httputil::{parse_headers, parse_multipart, parse_query_string};

fn bench_header_parsing(c: &mut Criterion) {
    let headers = "Host: example.org\r\n\
                   User-Agent: Mozilla/5.0 (X11; Linux x86_64)\r\n\
                   Accept: text/html,application/xhtml+xml\r\n\
                   Accept-Language: en-US,en;q=0.5\r\n\
                   Accept-Encoding: gzip, deflate\r\n\
                   Connection: keep-alive\r\n\
                   Cookie: session=abc123; theme=dark\r\n";

    c.bench_function("parse_headers", |b| {
        b.iter(|| black_box(parse_headers(black_box(headers)).unwrap()));
    });
}

fn bench_query_string_parsing(c: &mut Criterion) {
    let query = "name=bob&tag=a&tag=b&note=hi%20there&page=2";

    c.bench_function("parse_query_string", |b| {
        b.iter(|| black_box(parse_query_string(black_box(query))));
    });
}

fn bench_multipart_parsing(c: &mut Criterion) {
    let body: &[u8] = b"--frontier\r\n\
                        Content-Disposition: form-data; name=\"title\"\r\n\r\n\
                        hello\r\n\
                        --frontier\r\n\
                        Content-Disposition: form-data; name=\"upload\"; filename=\"a.bin\"\r\n\
                        Content-Type: application/octet-stream\r\n\r\n\
                        \x00\x01BIN\r\n\
                        --frontier--\r\n";

    c.bench_function("parse_multipart", |b| {
        b.iter(|| {
            let mut arguments = HashMap::new();
            let mut files = HashMap::new();
            parse_multipart("frontier", black_box(body), &mut arguments, &mut files);
            black_box((arguments, files));
        });
    });
}

criterion_group!(benches, bench_header_parsing, bench_query_string_parsing, bench_multipart_parsing);
criterion_main!(benches);
