// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end publish/receive over the in-process transport: value flow,
//! identity filtering, heartbeats, receive timeouts.

mod common;

use common::*;
use std::time::Duration;
use uapub::protocol::PublisherId;
use uapub::pubsub::*;
use uapub::types::{NodeId, StatusCode, Variant};
use uapub::PubSubState;

struct PubSide {
    conn: NodeId,
    wg: NodeId,
    source: NodeId,
}

fn build_pub_side(rt: &TestRt, publisher_id: PublisherId) -> PubSide {
    let source = NodeId::numeric(2, 1);
    rt.space.put_variable(source.clone(), Variant::Double(21.5));

    let conn =
        rt.manager.add_connection(&connection_cfg("pub", publisher_id)).expect("pub connection");
    let pds = rt
        .manager
        .add_published_dataset(&PublishedDataSetConfig { name: "p1".into(), ..Default::default() })
        .expect("pds");
    rt.manager.add_dataset_field(&pds, &field_cfg(&source, "value")).expect("field");
    let wg = rt
        .manager
        .add_writer_group(
            &conn,
            &WriterGroupConfig {
                name: "wg".into(),
                writer_group_id: 100,
                publishing_interval_ms: 10.0,
                ..Default::default()
            },
        )
        .expect("wg");
    let dsw = rt
        .manager
        .add_dataset_writer(
            &wg,
            &pds,
            &DataSetWriterConfig { name: "dsw".into(), dataset_writer_id: 1, ..Default::default() },
        )
        .expect("dsw");
    rt.manager.enable_dataset_writer(&dsw).expect("enable dsw");
    PubSide { conn, wg, source }
}

fn build_sub_side(
    rt: &TestRt,
    name: &str,
    publisher_id: PublisherId,
    timeout_ms: f64,
) -> (NodeId, NodeId, NodeId) {
    let target = NodeId::numeric(3, 1);
    rt.space.put_variable(target.clone(), Variant::Double(0.0));

    let conn =
        rt.manager.add_connection(&connection_cfg(name, PublisherId::UInt32(9999))).expect("sub connection");
    let rg = rt
        .manager
        .add_reader_group(&conn, &ReaderGroupConfig { name: format!("{}-rg", name), ..Default::default() })
        .expect("rg");
    let mut cfg = reader_cfg(&format!("{}-dsr", name), publisher_id, 100, 1, &target);
    cfg.message_receive_timeout_ms = timeout_ms;
    let dsr = rt.manager.add_dataset_reader(&rg, &cfg).expect("dsr");
    rt.manager.enable_dataset_reader(&dsr).expect("enable dsr");
    (conn, rg, target)
}

fn enable_all(rt: &TestRt, nodes: &[(&NodeId, bool)]) {
    rt.manager.start();
    for (node, is_reader_group) in nodes {
        if rt.manager.get_connection_state(node).is_ok() {
            rt.manager.enable_connection(node).expect("enable connection");
        } else if *is_reader_group {
            rt.manager.enable_reader_group(node).expect("enable rg");
        } else {
            rt.manager.enable_writer_group(node).expect("enable wg");
        }
        settle(&rt.el);
    }
}

#[test]
fn test_bare_publish_updates_target() {
    let rt = runtime();
    let p = build_pub_side(&rt, PublisherId::UInt32(2234));
    let (sub_conn, rg, target) = build_sub_side(&rt, "sub", PublisherId::UInt32(2234), 0.0);

    enable_all(&rt, &[(&p.conn, false), (&sub_conn, false), (&p.wg, false), (&rg, true)]);

    // The 10 ms publish timer runs on the loop; give it a few rounds.
    let before = rt.el_now();
    rt.run_until_value(&target, Variant::Double(21.5), Duration::from_millis(500));
    assert_eq!(rt.space.value_of(&target), Some(Variant::Double(21.5)));

    // lastPublishTimestamp is recent: under 100 ms of "now" (100ns ticks).
    let last = rt.manager.get_writer_group_last_publish_timestamp(&p.wg).expect("timestamp");
    assert!(last > 0);
    assert!(last >= before, "publish happened after enabling");
    assert!(rt.el_now() - last < 100 * 10_000_000, "last publish is recent");

    // Receipt of traffic promoted the reader side to Operational.
    assert_eq!(rt.manager.get_reader_group_state(&rg), Ok(PubSubState::Operational));

    // Value updates keep flowing.
    rt.space.put_variable(p.source.clone(), Variant::Double(23.75));
    rt.run_until_value(&target, Variant::Double(23.75), Duration::from_millis(500));
    assert_eq!(rt.space.value_of(&target), Some(Variant::Double(23.75)));
}

#[test]
fn test_identity_filtering_by_publisher_id() {
    let rt = runtime();
    let p = build_pub_side(&rt, PublisherId::UInt32(10));

    // Two readers in one group expecting different publisher ids.
    let target_a = NodeId::numeric(3, 10);
    let target_b = NodeId::numeric(3, 11);
    rt.space.put_variable(target_a.clone(), Variant::Double(-1.0));
    rt.space.put_variable(target_b.clone(), Variant::Double(-1.0));

    let sub_conn = rt
        .manager
        .add_connection(&connection_cfg("sub", PublisherId::UInt32(9999)))
        .expect("sub connection");
    let rg = rt
        .manager
        .add_reader_group(&sub_conn, &ReaderGroupConfig { name: "rg".into(), ..Default::default() })
        .expect("rg");
    let dsr_a = rt
        .manager
        .add_dataset_reader(&rg, &reader_cfg("ra", PublisherId::UInt32(10), 100, 1, &target_a))
        .expect("dsr a");
    let dsr_b = rt
        .manager
        .add_dataset_reader(&rg, &reader_cfg("rb", PublisherId::UInt32(11), 100, 1, &target_b))
        .expect("dsr b");
    rt.manager.enable_dataset_reader(&dsr_a).expect("enable a");
    rt.manager.enable_dataset_reader(&dsr_b).expect("enable b");

    enable_all(&rt, &[(&p.conn, false), (&sub_conn, false), (&p.wg, false), (&rg, true)]);
    rt.run_until_value(&target_a, Variant::Double(21.5), Duration::from_millis(500));

    // Only the matching reader's target was written.
    assert_eq!(rt.space.value_of(&target_a), Some(Variant::Double(21.5)));
    assert_eq!(rt.space.value_of(&target_b), Some(Variant::Double(-1.0)));

    // Same-value different-variant ids must not match either.
    assert_eq!(rt.manager.get_dataset_reader_state(&dsr_a), Ok(PubSubState::Operational));
    assert_eq!(rt.manager.get_dataset_reader_state(&dsr_b), Ok(PubSubState::PreOperational));
}

#[test]
fn test_wrong_writer_group_id_is_filtered() {
    let rt = runtime();
    let p = build_pub_side(&rt, PublisherId::UInt32(10));

    let target = NodeId::numeric(3, 20);
    rt.space.put_variable(target.clone(), Variant::Double(-1.0));
    let sub_conn = rt
        .manager
        .add_connection(&connection_cfg("sub", PublisherId::UInt32(9999)))
        .expect("sub connection");
    let rg = rt
        .manager
        .add_reader_group(&sub_conn, &ReaderGroupConfig { name: "rg".into(), ..Default::default() })
        .expect("rg");
    // WriterGroupId 101 while the wire carries 100.
    let dsr = rt
        .manager
        .add_dataset_reader(&rg, &reader_cfg("r", PublisherId::UInt32(10), 101, 1, &target))
        .expect("dsr");
    rt.manager.enable_dataset_reader(&dsr).expect("enable");

    enable_all(&rt, &[(&p.conn, false), (&sub_conn, false), (&p.wg, false), (&rg, true)]);
    for _ in 0..20 {
        rt.el.run_iterate(Duration::from_millis(5));
    }

    assert_eq!(rt.space.value_of(&target), Some(Variant::Double(-1.0)));
    assert_eq!(rt.manager.get_dataset_reader_state(&dsr), Ok(PubSubState::PreOperational));
}

#[test]
fn test_receive_timeout_drives_reader_to_error() {
    let (callbacks, log) = state_logging_callbacks();
    let rt = runtime_with(Vec::new(), callbacks);

    // Reader side only: nobody publishes.
    let (sub_conn, rg, _target) = build_sub_side(&rt, "sub", PublisherId::UInt32(77), 50.0);
    assert_eq!(rt.manager.dataset_reader_count(), 1);

    enable_all(&rt, &[(&sub_conn, false), (&rg, true)]);

    // After 50 ms of silence the reader is in Error with BadTimeout.
    let deadline = std::time::Instant::now() + Duration::from_millis(500);
    let mut reader_node = None;
    while std::time::Instant::now() < deadline {
        rt.el.run_iterate(Duration::from_millis(5));
        if let Some((node, _, _)) = log
            .lock()
            .iter()
            .find(|(_, s, r)| *s == PubSubState::Error && *r == StatusCode::BAD_TIMEOUT)
        {
            reader_node = Some(node.clone());
            break;
        }
    }
    let reader_node = reader_node.expect("timeout notification");
    assert_eq!(rt.manager.get_dataset_reader_state(&reader_node), Ok(PubSubState::Error));

    // The callback fired exactly once with that reason.
    let count = log
        .lock()
        .iter()
        .filter(|(n, s, r)| {
            *n == reader_node && *s == PubSubState::Error && *r == StatusCode::BAD_TIMEOUT
        })
        .count();
    assert_eq!(count, 1);
}

#[test]
fn test_heartbeat_writer_keeps_reader_alive() {
    let rt = runtime();

    // Heartbeat writer: no PublishedDataSet behind the DataSetWriter.
    let pub_conn = rt
        .manager
        .add_connection(&connection_cfg("pub", PublisherId::UInt32(5)))
        .expect("pub connection");
    let wg = rt
        .manager
        .add_writer_group(
            &pub_conn,
            &WriterGroupConfig {
                name: "hb".into(),
                writer_group_id: 100,
                publishing_interval_ms: 10.0,
                ..Default::default()
            },
        )
        .expect("wg");
    let dsw = rt
        .manager
        .add_dataset_writer(
            &wg,
            &NodeId::NULL,
            &DataSetWriterConfig { name: "hb-dsw".into(), dataset_writer_id: 1, ..Default::default() },
        )
        .expect("heartbeat dsw");
    rt.manager.enable_dataset_writer(&dsw).expect("enable dsw");

    let (sub_conn, rg, target) = build_sub_side(&rt, "sub", PublisherId::UInt32(5), 200.0);
    enable_all(&rt, &[(&pub_conn, false), (&sub_conn, false), (&wg, false), (&rg, true)]);

    // Heartbeats make the reader Operational but never write the target.
    let deadline = std::time::Instant::now() + Duration::from_millis(500);
    while std::time::Instant::now() < deadline {
        rt.el.run_iterate(Duration::from_millis(5));
        if rt.manager.get_reader_group_state(&rg) == Ok(PubSubState::Operational) {
            break;
        }
    }
    assert_eq!(rt.manager.get_reader_group_state(&rg), Ok(PubSubState::Operational));
    assert_eq!(rt.space.value_of(&target), Some(Variant::Double(0.0)));
}

// Small helpers on the fixture for readability.
impl TestRt {
    fn el_now(&self) -> i64 {
        use uapub::eventloop::EventLoop;
        self.el.now_monotonic()
    }

    fn run_until_value(&self, node: &NodeId, expected: Variant, budget: Duration) {
        let deadline = std::time::Instant::now() + budget;
        while std::time::Instant::now() < deadline {
            self.el.run_iterate(Duration::from_millis(5));
            if self.space.value_of(node) == Some(expected.clone()) {
                return;
            }
        }
    }
}
