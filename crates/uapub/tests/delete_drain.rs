// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Two-phase deletion: a Connection with open channels is flagged, moved to
//! Disabled, and freed only after the last channel's Closing callback.

mod common;

use common::*;
use std::time::Duration;
use uapub::protocol::PublisherId;
use uapub::pubsub::*;
use uapub::types::{NodeId, Variant};
use uapub::PubSubState;

#[test]
fn test_delete_while_channels_open() {
    let rt = runtime();
    let source = NodeId::numeric(2, 1);
    rt.space.put_variable(source.clone(), Variant::Double(1.0));

    let conn = rt
        .manager
        .add_connection(&connection_cfg("doomed", PublisherId::UInt32(3)))
        .expect("connection");
    let pds = rt
        .manager
        .add_published_dataset(&PublishedDataSetConfig { name: "p".into(), ..Default::default() })
        .expect("pds");
    rt.manager.add_dataset_field(&pds, &field_cfg(&source, "f")).expect("field");
    let wg = rt
        .manager
        .add_writer_group(
            &conn,
            &WriterGroupConfig {
                name: "wg".into(),
                writer_group_id: 1,
                publishing_interval_ms: 10.0,
                ..Default::default()
            },
        )
        .expect("wg");
    let rg = rt
        .manager
        .add_reader_group(&conn, &ReaderGroupConfig { name: "rg".into(), ..Default::default() })
        .expect("rg");

    rt.manager.start();
    rt.manager.enable_connection(&conn).expect("enable");
    rt.manager.enable_writer_group(&wg).expect("enable wg");
    rt.manager.enable_reader_group(&rg).expect("enable rg");
    settle(&rt.el);
    assert_eq!(rt.manager.get_connection_state(&conn), Ok(PubSubState::Operational));

    // Remove while send + recv channels are open. The component survives
    // until the transport has confirmed every close.
    rt.manager.remove_connection(&conn).expect("remove");
    assert_eq!(rt.manager.get_connection_state(&conn), Ok(PubSubState::Disabled));
    assert_eq!(rt.manager.connection_count(), 1, "channels still draining");

    // The groups are already gone.
    assert_eq!(rt.manager.writer_group_count(), 0);
    assert_eq!(rt.manager.reader_group_count(), 0);

    // Drain: the Closing callbacks free the connection.
    for _ in 0..20 {
        rt.el.run_iterate(Duration::from_millis(1));
        if rt.manager.connection_count() == 0 {
            break;
        }
    }
    assert_eq!(rt.manager.connection_count(), 0);

    // The id is dead afterwards.
    assert!(rt.manager.get_connection_state(&conn).is_err());
    assert!(rt.manager.enable_connection(&conn).is_err());
}

#[test]
fn test_delete_flagged_connection_cannot_be_reenabled() {
    let rt = runtime();
    let conn = rt
        .manager
        .add_connection(&connection_cfg("doomed", PublisherId::UInt32(3)))
        .expect("connection");
    let _rg = rt
        .manager
        .add_reader_group(&conn, &ReaderGroupConfig { name: "rg".into(), ..Default::default() })
        .expect("rg");

    rt.manager.start();
    rt.manager.enable_connection(&conn).expect("enable");
    settle(&rt.el);

    rt.manager.remove_connection(&conn).expect("remove");
    // Still linked (recv channel draining), but enabling must fail now.
    if rt.manager.connection_count() == 1 {
        assert!(rt.manager.enable_connection(&conn).is_err());
    }
    settle(&rt.el);
    assert_eq!(rt.manager.connection_count(), 0);
}

#[test]
fn test_stop_drains_to_stopped() {
    let rt = runtime();
    let conn = rt
        .manager
        .add_connection(&connection_cfg("c", PublisherId::UInt32(3)))
        .expect("connection");
    let _rg = rt
        .manager
        .add_reader_group(&conn, &ReaderGroupConfig { name: "rg".into(), ..Default::default() })
        .expect("rg");
    rt.manager.start();
    rt.manager.enable_connection(&conn).expect("enable");
    settle(&rt.el);

    rt.manager.stop();
    // Stopping completes once the channels report Closing.
    for _ in 0..20 {
        rt.el.run_iterate(Duration::from_millis(1));
        if rt.manager.lifecycle_state() == PubSubLifecycleState::Stopped {
            break;
        }
    }
    assert_eq!(rt.manager.lifecycle_state(), PubSubLifecycleState::Stopped);
}
