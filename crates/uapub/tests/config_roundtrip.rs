// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration file round-trip: save the live state, wipe the manager,
//! load it back, and inspect the rebuilt tree.

mod common;

use common::*;
use std::io::{Read, Write};
use uapub::protocol::PublisherId;
use uapub::pubsub::*;
use uapub::types::{NodeId, Variant};

fn build_tree(rt: &TestRt) {
    let source = NodeId::numeric(2, 1);
    rt.space.put_variable(source.clone(), Variant::Double(4.5));

    let conn = rt
        .manager
        .add_connection(&connection_cfg("conn-1", PublisherId::UInt32(2234)))
        .expect("connection");
    let pds = rt
        .manager
        .add_published_dataset(&PublishedDataSetConfig {
            name: "demo-pds".into(),
            ..Default::default()
        })
        .expect("pds");
    rt.manager.add_dataset_field(&pds, &field_cfg(&source, "speed")).expect("field");
    let wg = rt
        .manager
        .add_writer_group(
            &conn,
            &WriterGroupConfig {
                name: "wg-1".into(),
                writer_group_id: 100,
                publishing_interval_ms: 50.0,
                ..Default::default()
            },
        )
        .expect("wg");
    rt.manager
        .add_dataset_writer(
            &wg,
            &pds,
            &DataSetWriterConfig {
                name: "dsw-1".into(),
                dataset_writer_id: 1,
                ..Default::default()
            },
        )
        .expect("dsw");

    let rg = rt
        .manager
        .add_reader_group(&conn, &ReaderGroupConfig { name: "rg-1".into(), ..Default::default() })
        .expect("rg");
    let target = NodeId::numeric(3, 1);
    rt.space.put_variable(target.clone(), Variant::Double(0.0));
    rt.manager
        .add_dataset_reader(&rg, &reader_cfg("dsr-1", PublisherId::UInt32(2234), 100, 1, &target))
        .expect("dsr");
}

#[test]
fn test_save_wipe_load() {
    let rt = runtime();
    build_tree(&rt);

    let bytes = rt.manager.save_config().expect("save");
    assert!(!bytes.is_empty());

    // Loading replaces the whole manager state.
    rt.manager.load_config(&bytes).expect("load");

    assert_eq!(rt.manager.connection_count(), 1);
    assert_eq!(rt.manager.published_dataset_count(), 1);
    assert_eq!(rt.manager.writer_group_count(), 1);
    assert_eq!(rt.manager.dataset_writer_count(), 1);
    assert_eq!(rt.manager.reader_group_count(), 1);
    assert_eq!(rt.manager.dataset_reader_count(), 1);

    // Names survive the round trip.
    assert!(rt.manager.find_published_dataset("demo-pds").is_some());
    let pds = rt.manager.find_published_dataset("demo-pds").expect("pds");
    let md = rt.manager.get_published_dataset_metadata(&pds).expect("metadata");
    assert_eq!(md.fields.len(), 1);
    assert_eq!(md.fields[0].name, "speed");
    assert_eq!(md.fields[0].built_in_type, uapub::types::BuiltInType::Double as u8);
}

#[test]
fn test_roundtrip_through_file() {
    let rt = runtime();
    build_tree(&rt);
    let bytes = rt.manager.save_config().expect("save");

    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(&bytes).expect("write");
    file.flush().expect("flush");

    let mut read_back = Vec::new();
    std::fs::File::open(file.path())
        .expect("open")
        .read_to_end(&mut read_back)
        .expect("read");
    assert_eq!(read_back, bytes);

    let rt2 = runtime();
    rt2.manager.load_config(&read_back).expect("load into fresh manager");
    assert_eq!(rt2.manager.connection_count(), 1);
    assert_eq!(rt2.manager.published_dataset_count(), 1);

    // A reloaded manager round-trips to an equivalent tree.
    let again = rt2.manager.save_config().expect("save again");
    rt2.manager.load_config(&again).expect("load again");
    assert_eq!(rt2.manager.connection_count(), 1);
    assert_eq!(rt2.manager.writer_group_count(), 1);
    assert_eq!(rt2.manager.dataset_reader_count(), 1);
}

#[test]
fn test_reader_target_variables_survive() {
    let rt = runtime();
    build_tree(&rt);
    let bytes = rt.manager.save_config().expect("save");
    rt.manager.load_config(&bytes).expect("load");

    // Find the reloaded reader through its group.
    let conn_cfgs = rt.manager.connection_count();
    assert_eq!(conn_cfgs, 1);
    // The reader keeps its identity triple and one target variable.
    let all_states_ok = (1..200u32)
        .map(|i| NodeId::numeric(1, i))
        .filter_map(|n| rt.manager.get_dataset_reader_config(&n).ok())
        .any(|cfg| {
            cfg.publisher_id == PublisherId::UInt32(2234)
                && cfg.writer_group_id == 100
                && cfg.dataset_writer_id == 1
                && cfg.target_variables.len() == 1
                && cfg.target_variables[0].target_node_id == NodeId::numeric(3, 1)
        });
    assert!(all_states_ok, "reloaded reader configuration incomplete");
}

#[test]
fn test_load_garbage_fails_cleanly() {
    let rt = runtime();
    build_tree(&rt);
    assert!(rt.manager.load_config(b"definitely not a config").is_err());
    assert!(rt.manager.load_config(&[]).is_err());
}
