use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use realmnet::packet::{decode, encode, frame_len, Record, Value};
use realmnet::servers::auth::packet::login_request;
use realmnet::servers::world::WorldSchemas;

fn bench_login_request(c: &mut Criterion) {
    let schema = login_request().unwrap();
    let record = Record::new()
        .with("username", "alice")
        .with("password", "hunter2")
        .with("encrypt_key", Value::Array(vec![Value::from(1u32), Value::from(2u32), Value::from(3u32), Value::from(4u32)]));
    let bytes = encode(&schema, &record, Some(7)).unwrap();

    c.bench_function("encode_login_request", |b| {
        b.iter(|| encode(black_box(&schema), black_box(&record), Some(7)))
    });
    c.bench_function("decode_login_request", |b| {
        b.iter(|| decode(black_box(&schema), black_box(&bytes)))
    });
}

fn bench_chat(c: &mut Criterion) {
    let schemas = WorldSchemas::build().unwrap();
    let line = Record::new()
        .with("speaker", "Ayla")
        .with("text", "meet at the south gate before the next reset");
    let bytes = encode(&schemas.chat_out, &line, Some(0)).unwrap();

    c.bench_function("encode_chat", |b| {
        b.iter(|| encode(black_box(&schemas.chat_out), black_box(&line), Some(0)))
    });
    c.bench_function("frame_len_chat", |b| {
        b.iter(|| frame_len(black_box(&schemas.chat_out), black_box(&bytes), 1024))
    });
    c.bench_function("decode_chat", |b| {
        b.iter(|| decode(black_box(&schemas.chat_out), black_box(&bytes)))
    });
}

criterion_group!(benches, bench_login_request, bench_chat);
criterion_main!(benches);
