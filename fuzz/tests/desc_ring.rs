//! Bolero fuzzer for descriptor-ring push/pop sequences.
//!
//! Properties tested:
//! - FIFO ordering against a reference queue
//! - the ring never indexes outside its capacity
//! - head >= tail and len <= capacity after every operation
//! - full is reported exactly at capacity, wrap-around included

use bolero::check;
use ethmux_fuzz::ring_model::{execute_and_verify, RingOp, MAX_CAPACITY, MIN_CAPACITY};

fn main() {
    check!()
        .with_type::<(u8, Vec<(bool, u64)>)>()
        .for_each(|(capacity_byte, ops_data)| {
            let capacity = {
                let c = (*capacity_byte as u32 % (MAX_CAPACITY - MIN_CAPACITY + 1)) + MIN_CAPACITY;
                c.next_power_of_two().min(MAX_CAPACITY)
            };

            let ops: Vec<RingOp> = ops_data
                .iter()
                .map(|(is_push, cookie)| {
                    if *is_push {
                        RingOp::Push(*cookie)
                    } else {
                        RingOp::Pop
                    }
                })
                .collect();

            if let Err(e) = execute_and_verify(capacity, &ops) {
                panic!("invariant violated: {e}");
            }
        });
}

#[cfg(test)]
mod tests {
    use ethmux_fuzz::ring_model::{execute_and_verify, RingOp};

    #[test]
    fn interleaved_sequence() {
        let mut ops = Vec::new();
        for i in 0..100 {
            ops.push(RingOp::Push(i));
            if i % 3 == 0 {
                ops.push(RingOp::Pop);
            }
        }
        for _ in 0..100 {
            ops.push(RingOp::Pop);
        }
        execute_and_verify(16, &ops).unwrap();
    }

    #[test]
    fn overfill_then_drain() {
        let mut ops = Vec::new();
        for i in 0..12 {
            ops.push(RingOp::Push(i));
        }
        for _ in 0..12 {
            ops.push(RingOp::Pop);
        }
        execute_and_verify(8, &ops).unwrap();
    }
}
