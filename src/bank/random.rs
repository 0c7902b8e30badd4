//! Single-pass random selection.

use rand::Rng;

/// Pick `n` distinct indices out of `0..total`, in increasing order.
///
/// Each index is visited once and accepted with probability
/// `left_to_pick / left_to_look`, which yields every `n`-subset with equal
/// probability without building a permutation. When `n >= total` every
/// index is returned.
pub fn select_indices<R: Rng + ?Sized>(total: usize, n: usize, rng: &mut R) -> Vec<usize> {
    if n >= total {
        return (0..total).collect();
    }

    let mut selected = Vec::with_capacity(n);
    let mut left_to_pick = n;
    for i in 0..total {
        if left_to_pick == 0 {
            break;
        }
        let left_to_look = total - i;
        if rng.gen_range(0..left_to_look) < left_to_pick {
            selected.push(i);
            left_to_pick -= 1;
        }
    }
    selected
}

/// Pick `n` distinct elements of `items`, keeping their relative order.
pub fn select<T: Clone, R: Rng + ?Sized>(items: &[T], n: usize, rng: &mut R) -> Vec<T> {
    select_indices(items.len(), n, rng)
        .into_iter()
        .map(|i| items[i].clone())
        .collect()
}
