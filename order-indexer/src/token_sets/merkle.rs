//! Merkle commitments for attribute (token-list) sets.
//!
//! Leaves are keccak hashes of the 32-byte big-endian token ids,
//! deduplicated and sorted; inner nodes hash the sorted concatenation of
//! their children, so the root is independent of input order.

use web3::types::{H256, U256};
use wyvern::utils::keccak256;

#[must_use]
pub fn hash_token_id(token_id: U256) -> H256 {
    let mut bytes = [0_u8; 32];
    token_id.to_big_endian(&mut bytes);
    H256::from(keccak256(&bytes))
}

fn hash_pair(a: H256, b: H256) -> H256 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut bytes = [0_u8; 64];
    bytes[..32].copy_from_slice(lo.as_bytes());
    bytes[32..].copy_from_slice(hi.as_bytes());
    H256::from(keccak256(&bytes))
}

/// Compute the root over a set of token ids. An empty set commits to the
/// zero hash.
#[must_use]
pub fn merkle_root(token_ids: &[U256]) -> H256 {
    let mut leaves: Vec<H256> = {
        let mut ids = token_ids.to_vec();
        ids.sort();
        ids.dedup();
        ids.into_iter().map(hash_token_id).collect()
    };
    if leaves.is_empty() {
        return H256::zero();
    }
    while leaves.len() > 1 {
        leaves = leaves
            .chunks(2)
            .map(|pair| match pair {
                [a, b] => hash_pair(*a, *b),
                [a] => *a,
                _ => unreachable!(),
            })
            .collect();
    }
    leaves[0]
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_empty_set_commits_to_zero() {
        assert_eq!(merkle_root(&[]), H256::zero());
    }

    #[test]
    fn test_single_leaf_root() {
        let id = U256::from(7870);
        assert_eq!(merkle_root(&[id]), hash_token_id(id));
    }

    #[test]
    fn test_duplicates_collapse() {
        let ids = [U256::from(1), U256::from(2)];
        let duped = [U256::from(1), U256::from(2), U256::from(1)];
        assert_eq!(merkle_root(&ids), merkle_root(&duped));
    }

    #[test]
    fn test_root_covers_membership() {
        let ids: Vec<U256> = (0..5).map(U256::from).collect();
        let mut extended = ids.clone();
        extended.push(U256::from(99));
        assert_ne!(merkle_root(&ids), merkle_root(&extended));
    }

    proptest! {
        #[test]
        fn test_root_is_permutation_invariant(mut ids in prop::collection::vec(0_u64..1000, 1..32)) {
            let forward: Vec<U256> = ids.iter().copied().map(U256::from).collect();
            ids.reverse();
            let backward: Vec<U256> = ids.iter().copied().map(U256::from).collect();
            prop_assert_eq!(merkle_root(&forward), merkle_root(&backward));
        }
    }
}
