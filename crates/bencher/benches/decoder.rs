use std::hint::black_box;

use bencher::{TestCase, TestFile};
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ember_http::codec::HttpContext;

static SMALL_HEADER: TestFile = TestFile::new("get_small.txt", include_str!("../resources/request/get_small.txt"));
static LARGE_HEADER: TestFile = TestFile::new("get_large.txt", include_str!("../resources/request/get_large.txt"));
static CHUNKED_BODY: TestFile = TestFile::new("post_chunked.txt", include_str!("../resources/request/post_chunked.txt"));

fn create_test_cases() -> Vec<TestCase> {
    vec![
        TestCase::whole("small_header", SMALL_HEADER),
        TestCase::whole("large_header", LARGE_HEADER),
        TestCase::whole("chunked_body", CHUNKED_BODY),
        TestCase::fragmented("large_header_64b_reads", LARGE_HEADER, 64),
        TestCase::fragmented("chunked_body_16b_reads", CHUNKED_BODY, 16),
    ]
}

fn benchmark_http_context(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("http_context");

    for case in create_test_cases() {
        let arrivals = case.arrivals();
        group.throughput(Throughput::Bytes(case.file().bytes().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(case.name()), &arrivals, |b, arrivals| {
            b.iter_batched_ref(
                HttpContext::default,
                |context| {
                    let mut consumed = 0;
                    for available in arrivals {
                        consumed += context.parse(&available[consumed..]).expect("input should be a valid http request");
                    }
                    assert!(context.is_complete(), "{} should hold one complete request", case.file_name());
                    black_box(context.take_request());
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(decoder, benchmark_http_context);
criterion_main!(decoder);
