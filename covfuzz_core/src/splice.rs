use rand::Rng;
use rand::seq::IndexedRandom;
use rand_core::RngCore;

/// Head of `first` joined to the tail of `second` at independent random split
/// points. Parents shorter than two bytes leave `first` unchanged.
pub fn crossover(first: &[u8], second: &[u8], rng: &mut dyn RngCore) -> Vec<u8> {
    if first.len() < 2 || second.len() < 2 {
        return first.to_vec();
    }
    let head = rng.random_range(1..first.len());
    let tail = rng.random_range(1..second.len());
    let mut out = Vec::with_capacity(head + second.len() - tail);
    out.extend_from_slice(&first[..head]);
    out.extend_from_slice(&second[tail..]);
    out
}

/// Chains crossovers across up to `count` distinct parents.
pub fn multi_crossover<T: AsRef<[u8]>>(
    parents: &[T],
    count: usize,
    rng: &mut dyn RngCore,
) -> Vec<u8> {
    match parents {
        [] => Vec::new(),
        [only] => only.as_ref().to_vec(),
        _ => {
            let picked: Vec<&T> = parents
                .choose_multiple(rng, count.clamp(2, parents.len()))
                .collect();
            let mut out = picked[0].as_ref().to_vec();
            for parent in &picked[1..] {
                out = crossover(&out, parent.as_ref(), rng);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::from_seed([11; 32])
    }

    #[test]
    fn crossover_mixes_both_parents() {
        let mut rng = rng();
        let out = crossover(b"AAAA", b"BBBB", &mut rng);
        assert!(!out.is_empty());
        assert_eq!(out[0], b'A');
        assert_eq!(*out.last().unwrap(), b'B');
    }

    #[test]
    fn crossover_handles_uneven_parents() {
        let mut rng = rng();
        for _ in 0..20 {
            let out = crossover(b"SHORT", b"LONGER_INPUT", &mut rng);
            assert!(out.len() >= 2);
            assert!(out.len() <= 4 + 11);
        }
    }

    #[test]
    fn tiny_or_empty_parents_return_first() {
        let mut rng = rng();
        assert_eq!(crossover(b"A", b"B", &mut rng), b"A");
        assert_eq!(crossover(b"", b"BBB", &mut rng), b"");
        assert_eq!(crossover(b"AAA", b"", &mut rng), b"AAA");
    }

    #[test]
    fn multi_crossover_edge_cases() {
        let mut rng = rng();
        let none: [&[u8]; 0] = [];
        assert!(multi_crossover(&none, 3, &mut rng).is_empty());
        assert_eq!(multi_crossover(&[b"SINGLE".to_vec()], 3, &mut rng), b"SINGLE");
    }

    #[test]
    fn multi_crossover_uses_available_parents() {
        let mut rng = rng();
        let parents = vec![b"AAAA".to_vec(), b"BBBB".to_vec(), b"CCCC".to_vec(), b"DDDD".to_vec()];
        for count in [2, 3, 10] {
            let out = multi_crossover(&parents, count, &mut rng);
            assert!(!out.is_empty());
        }
    }
}
