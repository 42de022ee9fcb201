// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire-level checks of the publish pipeline: key/delta cadence, batching,
//! promoted-field solo sending, sequence-number monotonicity.

mod common;

use common::*;
use std::sync::Arc;
use uapub::protocol::uadp::{decode, DataSetMessageType, DataSetPayload};
use uapub::protocol::PublisherId;
use uapub::pubsub::*;
use uapub::types::{NodeId, Variant};

struct Fixture {
    rt: TestRt,
    capture: Arc<CaptureConnectionManager>,
    wg: NodeId,
    sources: Vec<NodeId>,
}

fn fixture(key_frame_count: u32, max_encapsulated: u16) -> Fixture {
    let capture = Arc::new(CaptureConnectionManager::new());
    let rt = runtime_with(vec![capture.clone()], PubSubCallbacks::default());

    let sources = vec![NodeId::numeric(2, 1), NodeId::numeric(2, 2)];
    rt.space.put_variable(sources[0].clone(), Variant::Double(1.0));
    rt.space.put_variable(sources[1].clone(), Variant::Double(2.0));

    let conn = rt
        .manager
        .add_connection(&connection_cfg("pub", PublisherId::UInt32(7)))
        .expect("connection");
    let pds = rt
        .manager
        .add_published_dataset(&PublishedDataSetConfig { name: "p".into(), ..Default::default() })
        .expect("pds");
    rt.manager.add_dataset_field(&pds, &field_cfg(&sources[0], "a")).expect("field a");
    rt.manager.add_dataset_field(&pds, &field_cfg(&sources[1], "b")).expect("field b");

    let wg = rt
        .manager
        .add_writer_group(
            &conn,
            &WriterGroupConfig {
                name: "wg".into(),
                writer_group_id: 1,
                publishing_interval_ms: 1_000_000.0, // ticks are triggered manually
                max_encapsulated_dataset_message_count: max_encapsulated,
                ..Default::default()
            },
        )
        .expect("wg");
    let dsw = rt
        .manager
        .add_dataset_writer(
            &wg,
            &pds,
            &DataSetWriterConfig {
                name: "dsw".into(),
                dataset_writer_id: 1,
                key_frame_count,
                ..Default::default()
            },
        )
        .expect("dsw");
    rt.manager.enable_dataset_writer(&dsw).expect("enable dsw");

    rt.manager.start();
    rt.manager.enable_connection(&conn).expect("enable conn");
    settle(&rt.el);
    rt.manager.enable_writer_group(&wg).expect("enable wg");
    settle(&rt.el);

    Fixture { rt, capture, wg, sources }
}

fn frame_types(capture: &CaptureConnectionManager) -> Vec<DataSetMessageType> {
    capture
        .sent_frames()
        .iter()
        .map(|frame| {
            let nm = decode::decode(frame, &[]).expect("decodable frame");
            nm.messages[0].header.message_type
        })
        .collect()
}

#[test]
fn test_key_delta_cadence() {
    let f = fixture(3, 3);
    for _ in 0..5 {
        f.rt.manager.trigger_writer_group_publish(&f.wg).expect("tick");
    }

    use DataSetMessageType::*;
    assert_eq!(frame_types(&f.capture), vec![KeyFrame, DeltaFrame, DeltaFrame, KeyFrame, DeltaFrame]);
}

#[test]
fn test_delta_frames_carry_only_changes() {
    let f = fixture(10, 3);
    f.rt.manager.trigger_writer_group_publish(&f.wg).expect("key tick");

    // Nothing changed: the delta is empty.
    f.rt.manager.trigger_writer_group_publish(&f.wg).expect("delta tick");

    // One of two fields changes: the delta carries exactly that field.
    f.rt.space.put_variable(f.sources[1].clone(), Variant::Double(9.0));
    f.rt.manager.trigger_writer_group_publish(&f.wg).expect("delta tick");

    let frames = f.capture.sent_frames();
    assert_eq!(frames.len(), 3);

    let empty_delta = decode::decode(&frames[1], &[]).expect("decode");
    match &empty_delta.messages[0].payload {
        DataSetPayload::DeltaFrame(fields) => assert!(fields.is_empty()),
        other => panic!("expected delta frame, got {:?}", other),
    }

    let delta = decode::decode(&frames[2], &[]).expect("decode");
    match &delta.messages[0].payload {
        DataSetPayload::DeltaFrame(fields) => {
            assert_eq!(fields.len(), 1);
            assert_eq!(fields[0].0, 1, "second field changed");
            assert_eq!(fields[0].1.value, Some(Variant::Double(9.0)));
        }
        other => panic!("expected delta frame, got {:?}", other),
    }
}

#[test]
fn test_sequence_numbers_strictly_increase() {
    let f = fixture(1, 3);
    for _ in 0..10 {
        f.rt.manager.trigger_writer_group_publish(&f.wg).expect("tick");
    }
    let seqs: Vec<u16> = f
        .capture
        .sent_frames()
        .iter()
        .map(|frame| decode::decode(frame, &[]).expect("decode").group_header.sequence_number)
        .collect();
    assert_eq!(seqs.len(), 10);
    for pair in seqs.windows(2) {
        assert_eq!(pair[1], pair[0].wrapping_add(1));
    }
}

#[test]
fn test_batching_respects_max_encapsulated() {
    // Three writers, at most two DataSetMessages per NetworkMessage.
    let f = fixture(1, 2);
    let pds = f.rt.manager.find_published_dataset("p").expect("pds");
    for id in [2u16, 3] {
        let dsw = f
            .rt
            .manager
            .add_dataset_writer(
                &f.wg,
                &pds,
                &DataSetWriterConfig {
                    name: format!("dsw{}", id),
                    dataset_writer_id: id,
                    key_frame_count: 1,
                    ..Default::default()
                },
            )
            .expect("dsw");
        f.rt.manager.enable_dataset_writer(&dsw).expect("enable");
    }

    f.rt.manager.trigger_writer_group_publish(&f.wg).expect("tick");
    let frames = f.capture.sent_frames();
    assert_eq!(frames.len(), 2, "3 writers split into 2+1");
    let first = decode::decode(&frames[0], &[]).expect("decode");
    let second = decode::decode(&frames[1], &[]).expect("decode");
    assert_eq!(first.messages.len(), 2);
    assert_eq!(first.dataset_writer_ids, vec![1, 2]);
    assert_eq!(second.messages.len(), 1);
    assert_eq!(second.dataset_writer_ids, vec![3]);
}

#[test]
fn test_offset_table_reports_mutable_positions() {
    use uapub::protocol::uadp::OffsetKind;

    let f = fixture(1, 3);
    let table = f
        .rt
        .manager
        .compute_writer_group_offset_table(&f.wg)
        .expect("offset table");

    // The group sequence number and both field values are patchable.
    assert!(table.iter().any(|e| e.kind == OffsetKind::NetworkMessageSequenceNumber));
    let fields: Vec<_> =
        table.iter().filter(|e| e.kind == OffsetKind::DataSetFieldVariant).collect();
    assert_eq!(fields.len(), 2);
    assert!(fields[0].offset < fields[1].offset);

    // Offsets point into a buffer of the exact frame layout: a real
    // publish produces a frame at least as large as the biggest offset.
    f.rt.manager.trigger_writer_group_publish(&f.wg).expect("tick");
    let frame = &f.capture.sent_frames()[0];
    let max_offset = table.iter().map(|e| e.offset).max().expect("entries");
    assert!(max_offset < frame.len());

    // Computing the table did not send anything extra.
    assert_eq!(f.capture.sent_frames().len(), 1);
}

#[test]
fn test_promoted_fields_force_solo_network_message() {
    let capture = Arc::new(CaptureConnectionManager::new());
    let rt = runtime_with(vec![capture.clone()], PubSubCallbacks::default());

    let source = NodeId::numeric(2, 1);
    rt.space.put_variable(source.clone(), Variant::Double(5.5));

    let conn = rt
        .manager
        .add_connection(&connection_cfg("pub", PublisherId::UInt32(7)))
        .expect("connection");

    // One PDS with a promoted field, one without.
    let promoted_pds = rt
        .manager
        .add_published_dataset(&PublishedDataSetConfig { name: "pp".into(), ..Default::default() })
        .expect("pds");
    let mut promoted_field = field_cfg(&source, "alarm");
    promoted_field.promoted_field = true;
    rt.manager.add_dataset_field(&promoted_pds, &promoted_field).expect("promoted field");

    let plain_pds = rt
        .manager
        .add_published_dataset(&PublishedDataSetConfig { name: "pl".into(), ..Default::default() })
        .expect("pds");
    rt.manager.add_dataset_field(&plain_pds, &field_cfg(&source, "value")).expect("field");

    let wg = rt
        .manager
        .add_writer_group(
            &conn,
            &WriterGroupConfig {
                name: "wg".into(),
                writer_group_id: 1,
                publishing_interval_ms: 1_000_000.0,
                max_encapsulated_dataset_message_count: 8,
                message_settings: UadpWriterGroupMessageSettings {
                    content_mask: NM_CONTENT_MASK_PUBLISHER_ID
                        | NM_CONTENT_MASK_GROUP_HEADER
                        | NM_CONTENT_MASK_WRITER_GROUP_ID
                        | NM_CONTENT_MASK_SEQUENCE_NUMBER
                        | NM_CONTENT_MASK_PAYLOAD_HEADER
                        | NM_CONTENT_MASK_PROMOTED_FIELDS,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .expect("wg");
    for (id, pds) in [(1u16, &promoted_pds), (2u16, &plain_pds)] {
        let dsw = rt
            .manager
            .add_dataset_writer(
                &wg,
                pds,
                &DataSetWriterConfig {
                    name: format!("dsw{}", id),
                    dataset_writer_id: id,
                    ..Default::default()
                },
            )
            .expect("dsw");
        rt.manager.enable_dataset_writer(&dsw).expect("enable");
    }

    rt.manager.start();
    rt.manager.enable_connection(&conn).expect("enable conn");
    settle(&rt.el);
    rt.manager.enable_writer_group(&wg).expect("enable wg");
    settle(&rt.el);

    rt.manager.trigger_writer_group_publish(&wg).expect("tick");

    // The promoted DataSetMessage went out alone, the plain one batched.
    let frames = capture.sent_frames();
    assert_eq!(frames.len(), 2);
    let solo = decode::decode(&frames[0], &[]).expect("decode");
    assert_eq!(solo.dataset_writer_ids, vec![1]);
    assert!(solo.promoted_fields_enabled);
    assert_eq!(solo.promoted_fields, vec![Variant::Double(5.5)]);
    let batch = decode::decode(&frames[1], &[]).expect("decode");
    assert_eq!(batch.dataset_writer_ids, vec![2]);
    assert!(!batch.promoted_fields_enabled);
}
