//! Property-based round-trip laws for the wire formats.

use hoplink::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use hoplink::crc::{ble_crc24, CRC_PRESET};
use hoplink::l2cap;
use hoplink::link::access_address::AccessAddress;
use hoplink::link::advertising::{ConnectRequestData, CONNECT_REQ_LEN};
use hoplink::link::channel_map::ChannelMap;
use hoplink::link::data::Llid;
use hoplink::link::{AddressKind, DeviceAddress};
use hoplink::att::{AttMsg, Handle};
use hoplink::uuid::Uuid16;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

fn valid_access_address() -> impl Strategy<Value = u32> {
    any::<u32>().prop_filter("invalid AA", |aa| AccessAddress::is_valid(*aa))
}

proptest! {
    #[test]
    fn generated_access_addresses_satisfy_all_rules(aa in valid_access_address()) {
        // The four §-rules restated independently of the implementation.
        prop_assert_ne!(aa, 0x8E89_BED6);

        let bits: Vec<u8> = (0..32).map(|i| ((aa >> i) & 1) as u8).collect();
        let mut max_run = 1;
        let mut run = 1;
        for w in bits.windows(2) {
            run = if w[0] == w[1] { run + 1 } else { 1 };
            max_run = max_run.max(run);
        }
        prop_assert!(max_run < 7);

        let transitions = bits.windows(2).filter(|w| w[0] != w[1]).count();
        prop_assert!(transitions >= 3);

        let high_transitions = bits[26..].windows(2).filter(|w| w[0] != w[1]).count();
        prop_assert!(high_transitions >= 2);
    }

    #[test]
    fn connect_req_round_trips_byte_exactly(
        init in proptest::array::uniform6(any::<u8>()),
        adv in proptest::array::uniform6(any::<u8>()),
        aa in valid_access_address(),
        crc_init in 0u32..0x100_0000,
        win_size in 1u8..=8,
        win_offset in 0u16..100,
        interval in 6u16..=3200,
        latency in 0u16..500,
        timeout in 10u16..=3200,
        map_bytes in proptest::array::uniform5(any::<u8>()),
        hop in 5u8..=16,
    ) {
        let map = ChannelMap::from_raw(map_bytes);
        let data = ConnectRequestData::new(
            &DeviceAddress::new(init, AddressKind::Random),
            &DeviceAddress::new(adv, AddressKind::Public),
            AccessAddress::from_raw(aa).unwrap(),
            crc_init,
            win_size,
            win_offset,
            interval,
            latency,
            timeout,
            map,
            hop,
        );

        let mut buf = [0; CONNECT_REQ_LEN as usize];
        data.to_bytes(&mut ByteWriter::new(&mut buf)).unwrap();

        let decoded = ConnectRequestData::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        prop_assert_eq!(decoded, data);

        let mut buf2 = [0; CONNECT_REQ_LEN as usize];
        decoded.to_bytes(&mut ByteWriter::new(&mut buf2)).unwrap();
        prop_assert_eq!(buf, buf2);
    }

    #[test]
    fn att_write_req_round_trips(handle in any::<u16>(), value in proptest::collection::vec(any::<u8>(), 0..=244)) {
        let msg = AttMsg::WriteReq {
            handle: Handle::from_raw(handle),
            value: hoplink::utils::HexSlice(&value[..]),
        };
        round_trip_att(&msg)?;
    }

    #[test]
    fn att_read_by_type_round_trips(start in any::<u16>(), end in any::<u16>(), uuid in any::<u16>()) {
        let msg = AttMsg::ReadByTypeReq {
            start: Handle::from_raw(start),
            end: Handle::from_raw(end),
            attribute_type: Uuid16(uuid),
        };
        round_trip_att(&msg)?;
    }

    #[test]
    fn l2cap_fragmentation_is_identity(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
        // Frame the payload, cut it into LL-sized fragments, reassemble.
        let mut frame = vec![0; l2cap::HEADER_SIZE + payload.len()];
        let n = l2cap::encode_frame(l2cap::Channel::ATT, &payload, &mut frame).unwrap();
        frame.truncate(n);

        let mut asm = l2cap::Assembler::new(vec![0; 4096 + l2cap::HEADER_SIZE].into_boxed_slice());
        let mut out = None;
        let mut fragments = frame.chunks(27).enumerate().peekable();
        while let Some((i, chunk)) = fragments.next() {
            let llid = if i == 0 { Llid::DataStart } else { Llid::DataCont };
            let done = asm.push(llid, chunk).unwrap();
            if fragments.peek().is_none() {
                out = done.map(|f| f.payload.to_vec());
            } else {
                prop_assert!(done.is_none());
            }
        }
        prop_assert_eq!(out.as_deref(), Some(&payload[..]));
    }

    #[test]
    fn crc_matches_bitwise_reference(data in proptest::collection::vec(any::<u8>(), 0..64), preset in 0u32..0x100_0000) {
        prop_assert_eq!(ble_crc24(&data, preset), crc24_reference(&data, preset));
    }
}

/// Bit-at-a-time CRC-24 over the reflected BLE polynomial.
fn crc24_reference(data: &[u8], preset: u32) -> u32 {
    let mut crc = preset & 0x00FF_FFFF;
    for byte in data {
        for bit in 0..8 {
            let feedback = (crc ^ u32::from(byte >> bit)) & 1;
            crc >>= 1;
            if feedback != 0 {
                crc ^= 0xDA6000;
            }
        }
    }
    crc & 0x00FF_FFFF
}

fn round_trip_att(msg: &AttMsg<'_>) -> Result<(), TestCaseError> {
    let mut buf = [0; 512];
    let mut writer = ByteWriter::new(&mut buf);
    msg.to_bytes(&mut writer).unwrap();
    let len = 512 - writer.space_left();

    let decoded = AttMsg::from_bytes(&mut ByteReader::new(&buf[..len])).unwrap();
    prop_assert_eq!(&decoded, msg);
    Ok(())
}

#[test]
fn advertising_crc_preset_is_spec_value() {
    assert_eq!(CRC_PRESET, 0x555555);
    // Known vector: CRC over an empty PDU is the preset itself.
    assert_eq!(ble_crc24(&[], CRC_PRESET), CRC_PRESET);
}
