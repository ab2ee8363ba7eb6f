//! Link-Layer integration tests against the scripted fake peer.

mod common;

use common::{
    adv_ind, connected_link, drive_events, poll_until, AdvPlan, MockRadio, MockTimer, PeerStep,
    TestConfig,
};
use hoplink::link::access_address::{AccessAddress, Lfsr};
use hoplink::link::data::Header;
use hoplink::link::{LinkEvent, LinkLayer, LinkState, Role, ScanParams};
use hoplink::phy::DataChannel;
use hoplink::time::Duration;

#[test]
fn slave_role_is_rejected() {
    let err = LinkLayer::<TestConfig>::new(
        MockRadio::new(),
        MockTimer::new(),
        Lfsr::new(1),
        Role::Slave,
    )
    .err();
    assert!(err.is_some());
}

#[test]
fn connect_req_is_well_formed() {
    let radio = MockRadio::new();
    let ll = connected_link(&radio);
    assert_eq!(ll.state(), LinkState::Connecting);

    let raw = radio.connect_req().expect("no CONNECT_REQ transmitted");
    assert_eq!(raw.len(), 2 + 34);
    // PDU type CONNECT_REQ, TxAdd and RxAdd set (both addresses random).
    assert_eq!(raw[0] & 0x0F, 0x05);
    assert_eq!(raw[0] & 0xC0, 0xC0);

    let lldata = radio.connect_req_lldata().expect("undecodable LLData");
    assert!(AccessAddress::is_valid(lldata.access_address().raw()));
    assert!((5..=16).contains(&lldata.hop()));
    assert_eq!(lldata.interval(), Duration::from_millis(50));
    assert_eq!(lldata.supervision_timeout(), Duration::from_secs(1));
    assert_eq!(lldata.channel_map().num_used_channels(), 37);

    // The radio must be listening for the generated Access Address now.
    assert_eq!(radio.sync_word(), lldata.access_address().sync_word());
    assert_eq!(radio.crc_init(), lldata.crc_init());
}

#[test]
fn empty_pdus_exchange_and_toggle_sequence_numbers() {
    let radio = MockRadio::new();
    let mut ll = connected_link(&radio);

    drive_events(&mut ll, &radio, 4);
    assert_eq!(ll.state(), LinkState::Connected);

    let events: Vec<_> = radio
        .tx_log()
        .into_iter()
        .skip(1) // CONNECT_REQ
        .collect();
    assert!(events.len() >= 4);

    for (n, (_, pdu)) in events.iter().take(4).enumerate() {
        let header = Header::parse(&pdu[..2]);
        assert_eq!(header.payload_length(), 0, "event {} not empty", n);
        // Each empty PDU is acknowledged, so SN alternates every event.
        assert_eq!(header.sn().bit(), n % 2 == 1, "SN wrong in event {}", n);
    }
}

#[test]
fn hop_sequence_follows_channel_selection() {
    let radio = MockRadio::new();
    let mut ll = connected_link(&radio);
    let hop = radio.connect_req_lldata().unwrap().hop();

    drive_events(&mut ll, &radio, 8);

    let mut unmapped = 0u8;
    for (n, (freq, _)) in radio.tx_log().into_iter().skip(1).take(8).enumerate() {
        unmapped = (unmapped + hop) % 37;
        let expected = DataChannel::new(unmapped).freq_hz();
        assert_eq!(freq, expected, "wrong channel in event {}", n);
    }
}

#[test]
fn connection_survives_crc_errors() {
    let radio = MockRadio::new();
    let mut ll = connected_link(&radio);
    radio.script(vec![
        PeerStep::AckEmpty,
        PeerStep::Corrupt,
        PeerStep::Corrupt,
        PeerStep::Corrupt,
    ]);

    drive_events(&mut ll, &radio, 4);
    let stats = ll.connection_stats().unwrap();
    assert_eq!(stats.consecutive_crc_errors, 3);
    assert_eq!(stats.total_crc_errors, 3);
    assert_eq!(ll.state(), LinkState::Connected);

    // A valid response resets the consecutive counter.
    drive_events(&mut ll, &radio, 1);
    let stats = ll.connection_stats().unwrap();
    assert_eq!(stats.consecutive_crc_errors, 0);
    assert_eq!(stats.total_crc_errors, 3);
}

#[test]
fn supervision_timeout_disconnects_with_0x08() {
    let radio = MockRadio::new();
    let mut ll = connected_link(&radio);
    radio.script(vec![PeerStep::AckEmpty]);
    radio.set_default_step(PeerStep::Silent);

    let event = poll_until(&mut ll, |e| matches!(e, LinkEvent::Disconnected { .. }));
    assert_eq!(event, LinkEvent::Disconnected { reason: 0x08 });
    assert_eq!(ll.state(), LinkState::Idle);
}

#[test]
fn unanswered_connection_gives_up_after_six_failures() {
    let radio = MockRadio::new();
    radio.set_default_step(PeerStep::Silent);
    let mut ll = connected_link(&radio);

    let event = poll_until(&mut ll, |e| matches!(e, LinkEvent::Disconnected { .. }));
    assert_eq!(event, LinkEvent::Disconnected { reason: 0x08 });
    // 7 failed events trip the pre-established guard.
    assert_eq!(radio.tx_log().len(), 1 + 7);
}

#[test]
fn local_disconnect_sends_terminate_ind() {
    let radio = MockRadio::new();
    let mut ll = connected_link(&radio);
    drive_events(&mut ll, &radio, 1);

    ll.disconnect(0x13).unwrap();
    assert_eq!(ll.state(), LinkState::Disconnecting);
    let event = poll_until(&mut ll, |e| matches!(e, LinkEvent::Disconnected { .. }));
    assert_eq!(event, LinkEvent::Disconnected { reason: 0x13 });

    assert!(radio.ctrl_rx().contains(&vec![0x02, 0x13]));
}

#[test]
fn peer_terminate_closes_with_its_reason() {
    let radio = MockRadio::new();
    let mut ll = connected_link(&radio);
    radio.script(vec![PeerStep::AckEmpty, PeerStep::Control(vec![0x02, 0x16])]);

    let event = poll_until(&mut ll, |e| matches!(e, LinkEvent::Disconnected { .. }));
    assert_eq!(event, LinkEvent::Disconnected { reason: 0x16 });
}

#[test]
fn feature_req_is_answered_with_empty_bitmap() {
    let radio = MockRadio::new();
    let mut ll = connected_link(&radio);
    radio.script(vec![PeerStep::Control(vec![
        0x08, 0x01, 0, 0, 0, 0, 0, 0, 0,
    ])]);

    drive_events(&mut ll, &radio, 3);
    assert!(radio
        .ctrl_rx()
        .contains(&vec![0x09, 0, 0, 0, 0, 0, 0, 0, 0]));
}

#[test]
fn unknown_control_opcode_draws_unknown_rsp() {
    let radio = MockRadio::new();
    let mut ll = connected_link(&radio);
    // LL_LENGTH_REQ, which this stack doesn't support.
    radio.script(vec![PeerStep::Control(vec![
        0x14, 0xFB, 0x00, 0x48, 0x08, 0xFB, 0x00, 0x48, 0x08,
    ])]);

    drive_events(&mut ll, &radio, 3);
    assert!(radio.ctrl_rx().contains(&vec![0x07, 0x14]));
}

#[test]
fn scan_filter_sees_advertising_data() {
    use hoplink::link::ad_structure::AdStructure;
    use hoplink::link::advertising::Advertisement;

    fn nordic_only(adv: &Advertisement<'_>) -> bool {
        AdStructure::find_local_name(adv.data) == Some("Nordic")
    }

    let radio = MockRadio::new();
    let mut ll = LinkLayer::<TestConfig>::new(
        radio.clone(),
        MockTimer::new(),
        Lfsr::new(9),
        Role::Master,
    )
    .unwrap();

    // Flags + complete local name "Nordic".
    let adv_data = [
        0x02, 0x01, 0x06, 0x07, 0x09, b'N', b'o', b'r', b'd', b'i', b'c',
    ];
    radio.plan_advertisement(AdvPlan {
        freq_hz: 2_402_000_000,
        pdu: adv_ind([9, 9, 9, 9, 9, 9], &adv_data),
        rssi: -70,
    });

    ll.start_scan(
        &ScanParams {
            dwell: Duration::from_millis(10),
            timeout: Some(Duration::from_millis(100)),
        },
        Some(nordic_only),
    )
    .unwrap();

    let report = poll_until(&mut ll, |e| matches!(e, LinkEvent::AdvReport { .. }));
    match report {
        LinkEvent::AdvReport { advertiser, .. } => {
            assert_eq!(advertiser.raw(), &[9, 9, 9, 9, 9, 9]);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn scan_reports_and_timeout() {
    let radio = MockRadio::new();
    let mut ll = LinkLayer::<TestConfig>::new(
        radio.clone(),
        MockTimer::new(),
        Lfsr::new(3),
        Role::Master,
    )
    .unwrap();

    radio.plan_advertisement(AdvPlan {
        freq_hz: 2_402_000_000,
        pdu: adv_ind([1, 2, 3, 4, 5, 6], &[0x02, 0x01, 0x06]),
        rssi: -42,
    });
    ll.start_scan(
        &ScanParams {
            dwell: Duration::from_millis(10),
            timeout: Some(Duration::from_millis(100)),
        },
        None,
    )
    .unwrap();
    assert_eq!(ll.state(), LinkState::Scanning);

    let report = poll_until(&mut ll, |e| matches!(e, LinkEvent::AdvReport { .. }));
    match report {
        LinkEvent::AdvReport {
            advertiser,
            rssi,
            connectable,
        } => {
            assert_eq!(advertiser.raw(), &[1, 2, 3, 4, 5, 6]);
            assert_eq!(rssi, -42);
            assert!(connectable);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let event = poll_until(&mut ll, |e| matches!(e, LinkEvent::ScanTimeout));
    assert_eq!(event, LinkEvent::ScanTimeout);
    assert_eq!(ll.state(), LinkState::Idle);
}
