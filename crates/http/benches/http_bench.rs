use std::hint::black_box;

use bytes::BytesMut;
use criterion::{Criterion, criterion_group, criterion_main};
use ember_http::codec::{HttpContext, encode};
use ember_http::protocol::{ByteRange, HttpResponse};
use http::{HeaderValue, StatusCode, header};

fn bench_request_parse(c: &mut Criterion) {
    let request = b"GET /search?q=ember&page=2 HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n";

    c.bench_function("parse_simple_request", |b| {
        b.iter(|| {
            let mut context = HttpContext::default();
            black_box(context.parse(black_box(request)).unwrap());
            black_box(context.take_request());
        });
    });
}

fn bench_pipelined_parse(c: &mut Criterion) {
    let pipelined = b"GET /a HTTP/1.1\r\nHost: localhost\r\n\r\n".repeat(16);

    c.bench_function("parse_16_pipelined_requests", |b| {
        b.iter(|| {
            let mut context = HttpContext::default();
            let mut consumed = 0;
            while consumed < pipelined.len() {
                consumed += context.parse(&pipelined[consumed..]).unwrap();
                black_box(context.take_request());
                context.reset();
            }
        });
    });
}

fn bench_response_encode(c: &mut Criterion) {
    let mut response = HttpResponse::new(false);
    response.insert_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response.insert_header(header::SERVER, HeaderValue::from_static("ember"));
    response.set_body("Hello World!");

    let mut partial = HttpResponse::new(false);
    partial.set_status(StatusCode::PARTIAL_CONTENT);
    partial.enable_accept_ranges();
    let range = ByteRange::parse("bytes=100-199").and_then(|range| range.resolve(1024)).unwrap();
    partial.set_content_range(range.content_range(1024));

    c.bench_function("encode_simple_response", |b| {
        b.iter(|| {
            let mut dst = BytesMut::new();
            encode(black_box(&response), &mut dst);
            black_box(dst);
        });
    });

    c.bench_function("encode_partial_response_head", |b| {
        b.iter(|| {
            let mut dst = BytesMut::new();
            encode(black_box(&partial), &mut dst);
            black_box(dst);
        });
    });
}

criterion_group!(benches, bench_request_parse, bench_pipelined_parse, bench_response_encode);
criterion_main!(benches);
