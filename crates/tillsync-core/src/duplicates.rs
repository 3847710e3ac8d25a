//! Repeated-key detection for diagnostic reports.

use std::collections::HashSet;
use std::hash::Hash;

/// Every key that occurs more than once in `keys`, in a single pass.
pub fn find_duplicates<K, I>(keys: I) -> HashSet<K>
where
    K: Eq + Hash + Clone,
    I: IntoIterator<Item = K>,
{
    let mut seen = HashSet::new();
    let mut duplicates = HashSet::new();
    for key in keys {
        if !seen.insert(key.clone()) {
            duplicates.insert(key);
        }
    }
    duplicates
}
