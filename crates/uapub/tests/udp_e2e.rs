// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end over the real UDP transport (loopback interfaces).

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use uapub::protocol::{PublisherId, PROFILE_UDP_UADP};
use uapub::pubsub::*;
use uapub::transport::udp::UdpConnectionManager;
use uapub::types::{NodeId, Variant};
use uapub::PubSubState;

fn udp_runtime() -> TestRt {
    let udp = Arc::new(UdpConnectionManager::new().expect("udp cm"));
    runtime_with(vec![udp], PubSubCallbacks::default())
}

fn udp_connection(name: &str, url: &str, pid: PublisherId) -> PubSubConnectionConfig {
    PubSubConnectionConfig {
        name: name.into(),
        publisher_id: Some(pid),
        transport_profile_uri: PROFILE_UDP_UADP.into(),
        address: NetworkAddressUrl { network_interface: String::new(), url: url.into() },
        ..Default::default()
    }
}

#[test]
fn test_udp_unicast_publish_receive() {
    let rt = udp_runtime();
    let url = "opc.udp://127.0.0.1:46921";

    let source = NodeId::numeric(2, 1);
    rt.space.put_variable(source.clone(), Variant::Double(7.25));
    let target = NodeId::numeric(3, 1);
    rt.space.put_variable(target.clone(), Variant::Double(0.0));

    // Subscriber first so the socket is bound before traffic starts.
    let sub_conn = rt
        .manager
        .add_connection(&udp_connection("sub", "opc.udp://localhost:46921", PublisherId::UInt32(2)))
        .expect("sub connection");
    let rg = rt
        .manager
        .add_reader_group(&sub_conn, &ReaderGroupConfig { name: "rg".into(), ..Default::default() })
        .expect("rg");
    let dsr = rt
        .manager
        .add_dataset_reader(&rg, &reader_cfg("dsr", PublisherId::UInt32(1), 7, 1, &target))
        .expect("dsr");
    rt.manager.enable_dataset_reader(&dsr).expect("enable dsr");

    let pub_conn = rt
        .manager
        .add_connection(&udp_connection("pub", url, PublisherId::UInt32(1)))
        .expect("pub connection");
    let pds = rt
        .manager
        .add_published_dataset(&PublishedDataSetConfig { name: "p".into(), ..Default::default() })
        .expect("pds");
    rt.manager.add_dataset_field(&pds, &field_cfg(&source, "value")).expect("field");
    let wg = rt
        .manager
        .add_writer_group(
            &pub_conn,
            &WriterGroupConfig {
                name: "wg".into(),
                writer_group_id: 7,
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

    rt.manager.start();
    rt.manager.enable_connection(&sub_conn).expect("enable sub");
    rt.manager.enable_connection(&pub_conn).expect("enable pub");
    settle(&rt.el);
    rt.manager.enable_reader_group(&rg).expect("enable rg");
    rt.manager.enable_writer_group(&wg).expect("enable wg");
    settle(&rt.el);

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while std::time::Instant::now() < deadline {
        rt.el.run_iterate(Duration::from_millis(5));
        if rt.space.value_of(&target) == Some(Variant::Double(7.25)) {
            break;
        }
    }
    assert_eq!(rt.space.value_of(&target), Some(Variant::Double(7.25)));
    assert_eq!(rt.manager.get_dataset_reader_state(&dsr), Ok(PubSubState::Operational));
}

#[test]
fn test_udp_multicast_publish_receive() {
    let rt = udp_runtime();
    // Dedicated group/port so parallel tests do not cross-talk.
    let url = "opc.udp://224.0.0.22:46931/";

    let source = NodeId::numeric(2, 1);
    rt.space.put_variable(source.clone(), Variant::UInt32(424242));
    let target = NodeId::numeric(3, 1);
    rt.space.put_variable(target.clone(), Variant::UInt32(0));

    let sub_conn = rt
        .manager
        .add_connection(&udp_connection("sub", url, PublisherId::UInt32(2)))
        .expect("sub connection");
    let rg = rt
        .manager
        .add_reader_group(&sub_conn, &ReaderGroupConfig { name: "rg".into(), ..Default::default() })
        .expect("rg");
    let mut dsr_cfg = reader_cfg("dsr", PublisherId::UInt32(1), 7, 1, &target);
    dsr_cfg.dataset_metadata.fields[0].built_in_type = uapub::types::BuiltInType::UInt32 as u8;
    let dsr = rt.manager.add_dataset_reader(&rg, &dsr_cfg).expect("dsr");
    rt.manager.enable_dataset_reader(&dsr).expect("enable dsr");

    let pub_conn = rt
        .manager
        .add_connection(&udp_connection("pub", url, PublisherId::UInt32(1)))
        .expect("pub connection");
    let pds = rt
        .manager
        .add_published_dataset(&PublishedDataSetConfig { name: "p".into(), ..Default::default() })
        .expect("pds");
    rt.manager.add_dataset_field(&pds, &field_cfg(&source, "value")).expect("field");
    let wg = rt
        .manager
        .add_writer_group(
            &pub_conn,
            &WriterGroupConfig {
                name: "wg".into(),
                writer_group_id: 7,
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

    rt.manager.start();
    rt.manager.enable_connection(&sub_conn).expect("enable sub");
    rt.manager.enable_connection(&pub_conn).expect("enable pub");
    settle(&rt.el);
    rt.manager.enable_reader_group(&rg).expect("enable rg");
    rt.manager.enable_writer_group(&wg).expect("enable wg");
    settle(&rt.el);

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    let mut received = false;
    while std::time::Instant::now() < deadline {
        rt.el.run_iterate(Duration::from_millis(5));
        if rt.space.value_of(&target) == Some(Variant::UInt32(424242)) {
            received = true;
            break;
        }
    }
    // Multicast loopback can be administratively disabled; accept either
    // full delivery or a cleanly operational publisher.
    if received {
        assert_eq!(rt.manager.get_dataset_reader_state(&dsr), Ok(PubSubState::Operational));
    } else {
        assert_eq!(rt.manager.get_writer_group_state(&wg), Ok(PubSubState::Operational));
    }
}
