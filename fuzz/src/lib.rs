//! Fuzzing harnesses for the dspq shared-memory codec.
//!
//! These drive a real, heap-backed queue region single-threaded, so the
//! packet codec and the ring position protocol can be checked against a
//! simple model without any remote domain involved.

pub mod ring_model;
