//! Stream ID translation table
//!
//! One table per backend HTTP/2 connection. Client-visible ids are mapped to
//! upstream ids allocated in order 1, 3, 5, ... so the origin always sees a
//! well-formed client numbering no matter how the client leg numbered its
//! streams. Stream 0 is the connection itself and is never translated.

use super::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Highest stream id representable in 31 bits
const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

#[derive(Debug)]
struct Tables {
    forward: HashMap<u32, u32>,
    inverse: HashMap<u32, u32>,
    next_upstream_id: u32,
}

/// Bidirectional client ↔ upstream stream id map
///
/// Both directions live behind a single lock, so an allocation inserts the
/// forward and inverse entries together and concurrent callers can never
/// observe half of a mapping.
#[derive(Debug)]
pub struct StreamIdMap {
    tables: Mutex<Tables>,
}

impl Default for StreamIdMap {
    fn default() -> Self {
        StreamIdMap::new()
    }
}

impl StreamIdMap {
    pub fn new() -> Self {
        StreamIdMap {
            tables: Mutex::new(Tables {
                forward: HashMap::new(),
                inverse: HashMap::new(),
                next_upstream_id: 1,
            }),
        }
    }

    /// Upstream id for `origin_id`, allocating the next odd id on first use
    pub fn upstream_id(&self, origin_id: u32) -> Result<u32> {
        if origin_id == 0 {
            return Ok(0);
        }

        let mut tables = self.tables.lock();
        if let Some(&upstream) = tables.forward.get(&origin_id) {
            return Ok(upstream);
        }

        let upstream = tables.next_upstream_id;
        if upstream > MAX_STREAM_ID {
            return Err(Error::StreamIdsExhausted);
        }
        tables.next_upstream_id = upstream + 2;
        tables.forward.insert(origin_id, upstream);
        tables.inverse.insert(upstream, origin_id);
        Ok(upstream)
    }

    /// Client-visible id for `upstream_id`, if one was ever allocated
    pub fn origin_id(&self, upstream_id: u32) -> Option<u32> {
        if upstream_id == 0 {
            return Some(0);
        }
        self.tables.lock().inverse.get(&upstream_id).copied()
    }

    /// Number of mapped streams
    pub fn len(&self) -> usize {
        self.tables.lock().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_allocation_is_odd_and_sequential() {
        let map = StreamIdMap::new();
        assert_eq!(map.upstream_id(7).unwrap(), 1);
        assert_eq!(map.upstream_id(3).unwrap(), 3);
        assert_eq!(map.upstream_id(101).unwrap(), 5);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_allocate_if_absent_is_stable() {
        let map = StreamIdMap::new();
        let first = map.upstream_id(11).unwrap();
        assert_eq!(map.upstream_id(11).unwrap(), first);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_inverse_lookup() {
        let map = StreamIdMap::new();
        map.upstream_id(9).unwrap();
        map.upstream_id(4).unwrap();
        assert_eq!(map.origin_id(1), Some(9));
        assert_eq!(map.origin_id(3), Some(4));
        assert_eq!(map.origin_id(5), None);
    }

    #[test]
    fn test_connection_stream_is_never_stored() {
        let map = StreamIdMap::new();
        assert_eq!(map.upstream_id(0).unwrap(), 0);
        assert_eq!(map.origin_id(0), Some(0));
        assert!(map.is_empty());
        assert_eq!(map.upstream_id(5).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_allocation_stays_bijective() {
        let map = Arc::new(StreamIdMap::new());
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    (0..250u32)
                        .map(|i| {
                            let origin = t * 1000 + i * 2 + 1;
                            (origin, map.upstream_id(origin).unwrap())
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut upstream_ids = HashSet::new();
        for handle in handles {
            for (origin, upstream) in handle.join().unwrap() {
                assert_eq!(upstream % 2, 1);
                assert!(upstream_ids.insert(upstream));
                assert_eq!(map.origin_id(upstream), Some(origin));
            }
        }

        let expected: HashSet<u32> = (0..2000u32).map(|n| 2 * n + 1).collect();
        assert_eq!(upstream_ids, expected);
    }
}
