use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use bff_parser::h1::request::H1Request;

const REQ: &[u8] = b"\
GET /health HTTP/1.1\r\n\
Host: bff.local\r\n\r\n";

const REQ_MED: &[u8] = b"\
GET /bonuses HTTP/1.1\r\n\
Accept: application/json\r\n\
Accept-Encoding: gzip, deflate, br\r\n\
Accept-Language: en-US,en;q=0.5\r\n\
Cache-Control: no-cache\r\n\
Connection: keep-alive\r\n\
DNT: 1\r\n\
Host: bff.local\r\n\
Pragma: no-cache\r\n\
User-Agent: Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/109.0\r\n\r\n";

const REQ_QUERY: &[u8] = b"\
GET /games?sort=popularity&page=3&per=50&lang=en HTTP/1.1\r\n\
Host: bff.local\r\n\
Connection: keep-alive\r\n\
User-Agent: wrk/4.2.0\r\n\r\n";

fn benchmark(c: &mut Criterion) {
    let inputs = [
        ("minimal", REQ),
        ("browser", REQ_MED),
        ("query", REQ_QUERY),
    ];

    let mut group = c.benchmark_group("parse");
    for (name, input) in inputs {
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), input, |b, input| {
            let mut request = H1Request::new();
            b.iter(|| black_box(request.parse(black_box(input))));
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
