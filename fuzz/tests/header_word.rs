//! Bolero fuzzer for decoding untrusted ring contents.
//!
//! The reader trusts nothing the other side wrote. Properties tested:
//! - Header words either decode or are rejected, never panic
//! - An accepted header word re-encodes to the same bits
//! - Locating and decoding at any position of a garbage ring stays in bounds

use bolero::check;
use dspq_shm::packet::{self, PacketHeader};
use dspq_shm::{BufferRef, RingBytes, SharedBuffer, MAX_BUFFERS, MAX_MESSAGE_SIZE};

#[test]
fn header_word_roundtrip() {
    check!().with_type::<u64>().for_each(|word| {
        if let Ok(header) = PacketHeader::from_word(*word, 0) {
            assert_eq!(header.to_word(), *word, "accepted word did not re-encode: {header:?}");
            assert_eq!(header.packet_len() % 8, 0);
        }
    });
}

#[test]
fn decode_garbage_ring() {
    check!()
        .with_type::<(u16, Vec<u8>)>()
        .for_each(|(pos_seed, bytes)| {
            let ring_len = (bytes.len().max(64) + 7) & !7;
            let buffer = SharedBuffer::heap(ring_len).unwrap();
            let region = buffer.region();
            region.write(0, bytes);
            let ring = RingBytes::new(region);

            let read_pos = (*pos_seed as u32 * 8) % ring_len as u32;
            let mut buffers = vec![BufferRef::default(); MAX_BUFFERS];
            let mut message = vec![0u8; MAX_MESSAGE_SIZE];
            if let Ok((header, next)) = packet::decode(&ring, read_pos, &mut buffers, &mut message) {
                assert!(header.packet_len() + 8 <= ring_len as u32);
                assert!(next < ring_len as u32);
                assert_eq!(next % 8, 0);
            }
        });
}

#[test]
fn zeroed_ring_is_rejected() {
    let buffer = SharedBuffer::heap(64).unwrap();
    let ring = RingBytes::new(buffer.region());
    assert!(packet::locate(&ring, 0).is_err());
}
