//! Bolero fuzzer for the event signal ring.
//!
//! Properties tested:
//! - A slot is only claimed after its previous occupant was cleared
//! - read_index never decreases
//! - Query reports NotReady exactly while the last record is outstanding
//! - Raised slots match the outstanding records

use bolero::check;
use gpucompat_fuzz::ring_model::{execute_and_verify, RingOp};

fn main() {
    check!().with_type::<Vec<(u8, u8)>>().for_each(|ops_data| {
        let ops: Vec<RingOp> = ops_data
            .iter()
            .map(|(kind, arg)| match kind % 8 {
                0..=3 => RingOp::Record,
                4 | 5 => RingOp::Complete(*arg),
                6 => RingOp::CompleteAll,
                _ => RingOp::Query,
            })
            .collect();

        if let Err(e) = execute_and_verify(&ops) {
            panic!("Invariant violated: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    #![allow(unused_imports)]
    use gpucompat_fuzz::ring_model::{execute_and_verify, RingOp};

    #[test]
    fn fuzz_ring_laps() {
        // Three full laps with nothing ever completed by the stream.
        let ops = vec![RingOp::Record; 100];
        execute_and_verify(&ops).unwrap();
    }

    #[test]
    fn fuzz_ring_out_of_order() {
        let ops = vec![
            RingOp::Record,
            RingOp::Record,
            RingOp::Record,
            RingOp::Complete(2),
            RingOp::Query,
            RingOp::Complete(0),
            RingOp::Record,
            RingOp::CompleteAll,
            RingOp::Query,
        ];
        execute_and_verify(&ops).unwrap();
    }
}
