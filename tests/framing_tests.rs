//! Property: a framing consumer honoring the reset-on-continue contract
//! decodes the same frames no matter how the byte stream is segmented.

use gale::{Buffer, Status};
use proptest::prelude::*;

fn frame_consumer(buf: &mut Buffer) -> Status<Vec<u8>> {
    if buf.readable_bytes() < 4 {
        return Status::Continue;
    }
    buf.mark_reader_index();
    let len = buf.read_i32() as usize;
    if buf.readable_bytes() < len {
        buf.reset_reader_index();
        return Status::Continue;
    }
    let mut payload = vec![0u8; len];
    buf.read_into(&mut payload);
    Status::StopWith(payload)
}

/// Mirrors the receive path: append one arriving segment, then drain every
/// frame the consumer can decode, compacting after each.
fn feed(buf: &mut Buffer, segment: &[u8], decoded: &mut Vec<Vec<u8>>) {
    buf.write_bytes(segment);
    loop {
        match frame_consumer(buf) {
            Status::Continue => break,
            Status::StopWith(payload) => {
                buf.discard_read_bytes();
                decoded.push(payload);
            }
            Status::Stop => unreachable!("consumer always carries a payload"),
        }
    }
}

proptest! {
    #[test]
    fn test_decoding_is_segmentation_invariant(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
        cuts in prop::collection::vec(1usize..16, 1..64),
    ) {
        let mut wire = Vec::new();
        for payload in &payloads {
            wire.extend_from_slice(&(payload.len() as i32).to_be_bytes());
            wire.extend_from_slice(payload);
        }

        let mut buf = Buffer::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        let mut round = 0;
        while offset < wire.len() {
            let step = cuts[round % cuts.len()];
            let end = (offset + step).min(wire.len());
            feed(&mut buf, &wire[offset..end], &mut decoded);
            offset = end;
            round += 1;
        }

        prop_assert_eq!(decoded, payloads);
        prop_assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_whole_wire_in_one_segment_decodes_identically(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
    ) {
        let mut wire = Vec::new();
        for payload in &payloads {
            wire.extend_from_slice(&(payload.len() as i32).to_be_bytes());
            wire.extend_from_slice(payload);
        }

        let mut buf = Buffer::new();
        let mut decoded = Vec::new();
        feed(&mut buf, &wire, &mut decoded);

        prop_assert_eq!(decoded, payloads);
    }
}
