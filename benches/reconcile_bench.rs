//! Stream reconciliation performance benchmarks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relaygate::adaptor::{Adaptor, OpenAIAdaptor};
use relaygate::services::reconciler::CapturedBody;
use relaygate::services::tokens::{count_text_tokens, preload_tokenizer};
use relaygate::utils::sse::SseLineDecoder;
use serde_json::json;

/// Create an OpenAI event stream with `chunks` content deltas
fn create_openai_stream(chunks: usize) -> String {
    let mut body = String::new();
    for i in 0..chunks {
        let chunk = json!({
            "id": "chatcmpl-bench",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": format!("token{} ", i)}, "finish_reason": null}]
        });
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// Benchmark: rebuilding reply text from captured bodies of growing length
fn bench_reconstruct_text(c: &mut Criterion) {
    let adaptor = OpenAIAdaptor::new(reqwest::Client::new());
    let mut group = c.benchmark_group("reconstruct_text");

    for chunks in [10, 100, 1000].iter() {
        let captured = CapturedBody::new(Bytes::from(create_openai_stream(*chunks)));
        group.bench_with_input(BenchmarkId::new("chunks", chunks), &captured, |b, captured| {
            b.iter(|| black_box(captured.reconstruct_text(|payload| adaptor.stream_fragment(payload))))
        });
    }

    group.finish();
}

/// Benchmark: line decoding at different transport split sizes
fn bench_line_decoder(c: &mut Criterion) {
    let body = create_openai_stream(200);
    let mut group = c.benchmark_group("sse_line_decoder");

    for split in [16, 256, 4096].iter() {
        group.bench_with_input(BenchmarkId::new("split", split), split, |b, &split| {
            b.iter(|| {
                let mut decoder = SseLineDecoder::new();
                let mut lines = 0;
                for piece in body.as_bytes().chunks(split) {
                    lines += decoder.push(black_box(piece)).len();
                }
                black_box(lines)
            })
        });
    }

    group.finish();
}

/// Benchmark: completion token estimation
fn bench_token_count(c: &mut Criterion) {
    preload_tokenizer();
    let mut group = c.benchmark_group("count_text_tokens");

    for size in [10, 1000, 10000].iter() {
        let text = "第一次世界大战 hello world ".repeat(*size / 10);
        group.bench_with_input(BenchmarkId::new("chars", size), &text, |b, text| {
            b.iter(|| black_box(count_text_tokens(black_box(text))))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_reconstruct_text, bench_line_decoder, bench_token_count);

criterion_main!(benches);
