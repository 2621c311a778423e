//! Contribution bitmap merging.

/// Result of merging a local bitmap into a received one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The two bitmaps differed: one side carried bits the other lacked.
    pub changed: bool,
    /// The merged bitmap has every participant's bit set.
    pub complete: bool,
}

impl MergeOutcome {
    /// Whether the merge calls for a relay.
    pub fn relay(&self) -> bool {
        self.changed
    }
}

/// OR `local` into `received` in place.
///
/// A byte counts as changed when the received and local bytes differ, so a
/// relay is requested whenever either side had something the other did not.
/// `mask` is the value the last byte takes once all participants are present.
pub fn merge_flags(received: &mut [u8], local: &[u8], mask: u8) -> MergeOutcome {
    debug_assert_eq!(received.len(), local.len());

    let mut changed = false;
    for (rx, &own) in received.iter_mut().zip(local) {
        changed |= *rx != own;
        *rx |= own;
    }

    MergeOutcome {
        changed,
        complete: is_complete(received, mask),
    }
}

/// Whether `flags` is the full bitmap: every byte `0xff` except the last,
/// which must equal `mask`.
pub fn is_complete(flags: &[u8], mask: u8) -> bool {
    match flags.split_last() {
        Some((&last, full)) => last == mask && full.iter().all(|&b| b == 0xff),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{seq::SliceRandom, Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_completion_three_participants() {
        assert!(is_complete(&[0b0000_0111], 0x07));
        assert!(!is_complete(&[0b0000_0011], 0x07));
    }

    #[test]
    fn test_completion_partial_last_byte() {
        // 10 participants: one full byte plus two bits
        assert!(is_complete(&[0xff, 0x03], 0x03));
        assert!(!is_complete(&[0xfe, 0x03], 0x03));
        assert!(!is_complete(&[0xff, 0x01], 0x03));
        assert!(!is_complete(&[], 0x03));
    }

    #[test]
    fn test_merge_reports_change_in_either_direction() {
        // Local has a bit the frame lacks
        let mut rx = [0x01];
        let outcome = merge_flags(&mut rx, &[0x02], 0x07);
        assert_eq!(rx, [0x03]);
        assert!(outcome.relay());
        assert!(!outcome.complete);

        // Frame has a bit the local copy lacks
        let mut rx = [0x07];
        let outcome = merge_flags(&mut rx, &[0x02], 0x07);
        assert_eq!(rx, [0x07]);
        assert!(outcome.changed);
        assert!(outcome.complete);

        // Identical bitmaps carry nothing new
        let mut rx = [0x05];
        let outcome = merge_flags(&mut rx, &[0x05], 0x07);
        assert!(!outcome.changed);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let local: Vec<u8> = (0..4).map(|_| rng.gen()).collect();
            let mut once: Vec<u8> = (0..4).map(|_| rng.gen()).collect();
            merge_flags(&mut once, &local, 0xff);

            let mut twice = once.clone();
            let outcome = merge_flags(&mut twice, &local, 0xff);
            assert_eq!(once, twice);
            // `once` already contains `local`, so only bits missing from local remain a change
            assert_eq!(outcome.changed, once != local);
        }
    }

    #[test]
    fn test_merge_order_does_not_matter() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let senders: Vec<Vec<u8>> = (0..6)
            .map(|_| (0..3).map(|_| rng.gen::<u8>() & rng.gen::<u8>()).collect())
            .collect();

        let mut reference = vec![0u8; 3];
        for s in &senders {
            merge_flags(&mut reference, s, 0x3f);
        }

        for _ in 0..50 {
            let mut order = senders.clone();
            order.shuffle(&mut rng);

            // Local copy is overwritten with the merged frame after every reception
            let mut local = vec![0u8; 3];
            let mut previous_bits = 0;
            for s in &order {
                let mut rx = s.clone();
                merge_flags(&mut rx, &local, 0x3f);
                local = rx;
                let bits: u32 = local.iter().map(|b| b.count_ones()).sum();
                assert!(bits >= previous_bits);
                previous_bits = bits;
            }
            assert_eq!(local, reference);
        }
    }
}
