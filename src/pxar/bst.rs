//! The "casync" cache-oblivious binary-search-tree layout used for the
//! GOODBYE table (§4.2). Preserved exactly as specified: this recurrence
//! is read by the server, so any deviation breaks binary compatibility.

/// Compute the destination permutation for a BST layout over `n` items
/// sorted by key. For every `(src, dst)` pair, `src` is an index into the
/// sorted input (ascending by hash) and `dst` is the index that item
/// occupies in the BST-arranged output. Calls `copy_func(src, dst)` once
/// per item; does not allocate or touch any buffer itself; the caller
/// decides how the indices are used (e.g. to scatter into an output
/// `Vec`).
pub fn copy_binary_search_tree(n: usize, copy_func: &mut dyn FnMut(usize, usize)) {
    build(0, n, 0, copy_func);
}

fn build(src_offset: usize, n: usize, dst_offset: usize, copy_func: &mut dyn FnMut(usize, usize)) {
    if n == 0 {
        return;
    }

    let k = root_index(n);
    copy_func(src_offset + k, dst_offset + k);
    build(src_offset, k, dst_offset, copy_func);
    build(src_offset + k + 1, n - k - 1, dst_offset + k + 1, copy_func);
}

/// `k = (2^e - 2)/2` if `n >= 2^(e-1) + 2^(e-1)/2 - 1`, else
/// `(2^e - 2)/2 - ((2^(e-1) + 2^(e-1)/2) - n - 1)`, where
/// `e = floor(log2(n)) + 1`.
fn root_index(n: usize) -> usize {
    debug_assert!(n > 0);
    let e = usize::BITS - n.leading_zeros(); // floor(log2(n)) + 1
    let half = 1usize << (e - 1); // 2^(e-1)
    let threshold = half + half / 2 - 1;
    let base = half - 1; // (2^e - 2) / 2

    if n >= threshold {
        base
    } else {
        base - ((half + half / 2) - n - 1)
    }
}

/// Arrange `sorted` (ascending by hash) into BST order, returning a new
/// `Vec` in output order.
pub fn arrange<T: Clone>(sorted: &[T]) -> Vec<T> {
    let n = sorted.len();
    let mut out: Vec<Option<T>> = vec![None; n];
    copy_binary_search_tree(n, &mut |src, dst| {
        out[dst] = Some(sorted[src].clone());
    });
    out.into_iter().map(|v| v.expect("bst permutation covers every slot")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_index_matches_hand_computed_values() {
        assert_eq!(root_index(1), 0);
        assert_eq!(root_index(2), 1);
        assert_eq!(root_index(3), 1);
        assert_eq!(root_index(4), 2);
    }

    #[test]
    fn permutation_is_total_and_unique() {
        for n in 1..200usize {
            let input: Vec<usize> = (0..n).collect();
            let mut seen = vec![false; n];
            copy_binary_search_tree(n, &mut |src, dst| {
                assert!(!seen[dst], "dst {} written twice for n={}", dst, n);
                seen[dst] = true;
                assert_eq!(src, input[src]);
            });
            assert!(seen.iter().all(|&s| s), "n={} left a gap", n);
        }
    }

    #[test]
    fn arrange_preserves_all_elements() {
        let sorted: Vec<u64> = (0..37).collect();
        let out = arrange(&sorted);
        let mut roundtrip = out.clone();
        roundtrip.sort_unstable();
        assert_eq!(roundtrip, sorted);
    }
}
