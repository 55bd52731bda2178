//! Bolero fuzzer for writing and reading packets through one ring.
//!
//! Properties tested:
//! - Packets come back in FIFO order with identical contents
//! - A write that does not fit leaves the ring untouched
//! - Used bytes and queued packets always match the model
//! - Eight bytes of slack are always kept free
//! - Relocation at the end of the ring round-trips

use bolero::check;
use dspq_fuzz::ring_model::{execute_and_verify, RingOp, MAX_RING, MIN_RING};

fn to_ops(ops_data: &[(u8, u8, u16, u8)]) -> Vec<RingOp> {
    ops_data
        .iter()
        .map(|&(kind, buffers, message_len, seed)| match kind % 4 {
            0 | 1 => RingOp::Write {
                buffers,
                message_len,
                seed,
            },
            2 => RingOp::Read,
            _ => RingOp::Peek,
        })
        .collect()
}

#[test]
fn packet_ring() {
    check!()
        .with_type::<(u16, Vec<(u8, u8, u16, u8)>)>()
        .for_each(|(size, ops_data)| {
            // Any multiple of 8 in range; the layout rounds odd sizes up.
            let ring_size = MIN_RING + (*size as u32 % (MAX_RING - MIN_RING + 1));
            let ops = to_ops(ops_data);

            if let Err(e) = execute_and_verify(ring_size, &ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}

#[test]
fn fill_then_drain_in_small_ring() {
    let mut ops = Vec::new();
    for round in 0..20u8 {
        for i in 0..6u8 {
            ops.push(RingOp::Write {
                buffers: i % 2,
                message_len: (round as u16 + i as u16) * 3,
                seed: round ^ i,
            });
        }
        for _ in 0..6 {
            ops.push(RingOp::Read);
        }
    }
    execute_and_verify(MIN_RING, &ops).unwrap();
}

#[test]
fn oversized_packets_never_fit() {
    let ops = [
        RingOp::Write {
            buffers: 4,
            message_len: 200,
            seed: 1,
        },
        RingOp::Read,
        RingOp::Peek,
    ];
    execute_and_verify(MIN_RING, &ops).unwrap();
}
