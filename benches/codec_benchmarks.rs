// ABOUTME: Criterion benchmarks for the wire parser and drawing-instruction encoder
// ABOUTME: Run with `cargo bench` once a registry entry exists for this target

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use guac_core::parser::Parser;

fn parse_single_instruction(c: &mut Criterion) {
    let data = b"5.mouse,3.100,3.200,1.1;";
    c.bench_function("parse single mouse instruction", |b| {
        b.iter(|| {
            let mut parser = Parser::new();
            parser.append(black_box(data));
            black_box(parser.is_complete())
        })
    });
}

fn parse_instruction_byte_at_a_time(c: &mut Criterion) {
    let data = b"5.mouse,3.100,3.200,1.1;";
    c.bench_function("parse mouse instruction byte-at-a-time", |b| {
        b.iter(|| {
            let mut parser = Parser::new();
            for &byte in data {
                parser.append(black_box(&[byte]));
            }
            black_box(parser.is_complete())
        })
    });
}

fn parse_large_blob_instruction(c: &mut Criterion) {
    let payload = "a".repeat(4096);
    let wire = format!("4.blob,{}.{};", payload.len(), payload);
    let data = wire.as_bytes();
    c.bench_function("parse 4KiB blob instruction", |b| {
        b.iter(|| {
            let mut parser = Parser::new();
            parser.append(black_box(data));
            black_box(parser.is_complete())
        })
    });
}

criterion_group!(
    benches,
    parse_single_instruction,
    parse_instruction_byte_at_a_time,
    parse_large_blob_instruction
);
criterion_main!(benches);
