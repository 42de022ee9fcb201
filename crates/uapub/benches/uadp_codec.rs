// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UADP codec throughput: encode and decode of a typical NetworkMessage.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use uapub::protocol::uadp::{
    decode, encode, DataSetMessage, DataSetMessageHeader, DataSetPayload, FieldEncoding,
    NetworkMessage,
};
use uapub::protocol::PublisherId;
use uapub::types::{DataValue, Variant};

fn sample_message(field_count: usize) -> NetworkMessage {
    let mut nm = NetworkMessage::new();
    nm.publisher_id_enabled = true;
    nm.publisher_id = Some(PublisherId::UInt32(2234));
    nm.group_header_enabled = true;
    nm.group_header.writer_group_id_enabled = true;
    nm.group_header.writer_group_id = 100;
    nm.group_header.sequence_number_enabled = true;
    nm.group_header.sequence_number = 4711;
    nm.payload_header_enabled = true;
    nm.dataset_writer_ids = vec![1];
    nm.messages = vec![DataSetMessage {
        header: DataSetMessageHeader {
            valid: true,
            field_encoding: FieldEncoding::Variant,
            sequence_number_enabled: true,
            sequence_number: 99,
            ..Default::default()
        },
        payload: DataSetPayload::KeyFrame(
            (0..field_count)
                .map(|i| DataValue::from_variant(Variant::Double(i as f64 * 0.5)))
                .collect(),
        ),
    }];
    nm
}

fn bench_encode(c: &mut Criterion) {
    let nm = sample_message(10);
    let size = encode::calc_size(&nm, &[]).expect("size");
    let mut buf = vec![0u8; size];
    c.bench_function("uadp_encode_10_doubles", |b| {
        b.iter(|| {
            encode::encode(black_box(&nm), &[], &mut buf, None).expect("encode");
        });
    });
}

fn bench_decode(c: &mut Criterion) {
    let nm = sample_message(10);
    let size = encode::calc_size(&nm, &[]).expect("size");
    let mut buf = vec![0u8; size];
    encode::encode(&nm, &[], &mut buf, None).expect("encode");
    c.bench_function("uadp_decode_10_doubles", |b| {
        b.iter(|| {
            decode::decode(black_box(&buf), &[]).expect("decode");
        });
    });
}

fn bench_sizing(c: &mut Criterion) {
    let nm = sample_message(50);
    c.bench_function("uadp_calc_size_50_doubles", |b| {
        b.iter(|| encode::calc_size(black_box(&nm), &[]).expect("size"));
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_sizing);
criterion_main!(benches);
