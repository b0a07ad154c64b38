//! Fuzzing harnesses for gpucompat.
//!
//! The ring harness drives the real signal ring over a header in ordinary
//! memory, next to a shadow model of which records are outstanding. Nothing
//! here maps shared memory or spawns a compiler.

pub mod prefix_model;
pub mod ring_model;
