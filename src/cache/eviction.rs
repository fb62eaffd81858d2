use std::collections::HashMap;
use std::str::FromStr;

use rand::seq::SliceRandom;

use super::entry::CacheEntry;
use crate::{Error, Result};

/// Victim selection rule applied when the cache outgrows its bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Oldest insertion first.
    #[default]
    Fifo,
    /// Least recently accessed first.
    Lru,
    /// Uniformly sampled.
    Random,
}

impl FromStr for EvictionPolicy {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        match text {
            "fifo" => Ok(EvictionPolicy::Fifo),
            "lru" => Ok(EvictionPolicy::Lru),
            "random" => Ok(EvictionPolicy::Random),
            _ => Err(Error::invalid(format!(
                "unknown eviction policy {:?} (expected fifo, lru, or random)",
                text
            ))),
        }
    }
}

/// Orders every entry into eviction order for `policy`. The caller walks the
/// result front to back until the size bound holds again.
pub(super) fn eviction_order(
    entries: &HashMap<String, CacheEntry>,
    policy: EvictionPolicy,
) -> Vec<String> {
    let mut order: Vec<(&String, &CacheEntry)> = entries.iter().collect();
    match policy {
        EvictionPolicy::Fifo => order.sort_by_key(|(_, e)| e.inserted_at),
        EvictionPolicy::Lru => order.sort_by_key(|(_, e)| e.last_accessed),
        EvictionPolicy::Random => order.shuffle(&mut rand::thread_rng()),
    }
    order.into_iter().map(|(fp, _)| fp.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(inserted_at: u64, last_accessed: u64) -> CacheEntry {
        CacheEntry {
            size: 1,
            inserted_at,
            last_accessed,
            etag: None,
        }
    }

    #[test]
    fn fifo_orders_by_insertion() {
        let entries = HashMap::from([
            ("b".to_string(), entry(2, 9)),
            ("a".to_string(), entry(1, 50)),
            ("c".to_string(), entry(3, 1)),
        ]);
        assert_eq!(eviction_order(&entries, EvictionPolicy::Fifo), ["a", "b", "c"]);
    }

    #[test]
    fn lru_orders_by_access() {
        let entries = HashMap::from([
            ("b".to_string(), entry(2, 9)),
            ("a".to_string(), entry(1, 50)),
            ("c".to_string(), entry(3, 1)),
        ]);
        assert_eq!(eviction_order(&entries, EvictionPolicy::Lru), ["c", "b", "a"]);
    }

    #[test]
    fn random_is_a_permutation() {
        let entries: HashMap<String, CacheEntry> =
            (0..16).map(|i| (format!("{}", i), entry(i, i))).collect();
        let mut order = eviction_order(&entries, EvictionPolicy::Random);
        order.sort_by_key(|fp| fp.parse::<u64>().unwrap());
        assert_eq!(order.len(), 16);
    }

    #[test]
    fn policies_parse() {
        assert_eq!("fifo".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Fifo);
        assert_eq!("lru".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Lru);
        assert!("mru".parse::<EvictionPolicy>().is_err());
    }
}
