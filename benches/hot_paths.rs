use criterion::{black_box, criterion_group, criterion_main, Criterion};

use robprof::bridge::TraceInfo;
use robprof::token::{
    RobToken, SlotRecord, INSTR_COMMITS, INSTR_VALID, ROB_COMMITTING, ROB_POPULATED, TOKEN_BYTES,
};
use robprof::worker::oracle::Oracle;
use robprof::worker::TraceWorker;

fn synthetic_buffer(tokens: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(tokens * TOKEN_BYTES);
    for i in 0..tokens {
        let cycle = i as u64 * 3;
        let token = if i % 4 == 0 {
            let mut token = RobToken {
                tsc_cycle: cycle,
                rob: ROB_POPULATED,
                ..RobToken::default()
            };
            token.slots[0] = SlotRecord {
                flags: INSTR_VALID,
                address: 0x8000_0000 + i as u64,
                ..SlotRecord::default()
            };
            token
        } else {
            let mut token = RobToken {
                tsc_cycle: cycle,
                rob: ROB_COMMITTING,
                ..RobToken::default()
            };
            for slot in 0..(i % 4) {
                token.slots[slot] = SlotRecord {
                    flags: INSTR_COMMITS | INSTR_VALID,
                    address: 0x8000_0000 + (i * 4 + slot) as u64,
                    memlat: (i % 90) as u16,
                    isslat: (i % 7) as u16,
                };
            }
            token
        };
        data.extend_from_slice(&token.encode());
    }
    data
}

fn bench_token_decode(c: &mut Criterion) {
    let data = synthetic_buffer(1);
    let record: &[u8; TOKEN_BYTES] = data[..TOKEN_BYTES].try_into().unwrap();

    c.bench_function("token/decode", |b| {
        b.iter(|| RobToken::decode(black_box(record)))
    });
}

fn bench_oracle_tick(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let info = TraceInfo {
        tracer_id: 0,
        token_bytes: TOKEN_BYTES,
        output_dir: dir.path().to_path_buf(),
    };

    let tokens = 4096;
    let data = synthetic_buffer(tokens);

    // A fresh worker per run keeps the cycle counter monotonic.
    c.bench_function("oracle/tick_4096_tokens", |b| {
        b.iter_batched(
            || Oracle::new(&[], &info, Some(1)).expect("oracle"),
            |mut oracle| oracle.tick(black_box(&data), black_box(tokens)),
            criterion::BatchSize::LargeInput,
        )
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_token_decode(c);
    bench_oracle_tick(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
