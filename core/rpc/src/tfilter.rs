// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Transfer filters: reversible byte transforms applied to message bodies.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use lazy_static::lazy_static;

use crate::status::{Code, Status};

pub const GZIP_ID: u8 = b'g';

pub trait TransferFilter: Send + Sync + 'static {
    /// Single byte carried on the wire.
    fn id(&self) -> u8;

    fn name(&self) -> &str;

    fn on_pack(&self, src: Bytes) -> Result<Bytes, Status>;

    /// Restore `src`. The output may not grow past `limit` bytes; zero
    /// means unbounded.
    fn on_unpack(&self, src: Bytes, limit: usize) -> Result<Bytes, Status>;
}

fn exceeds(limit: usize, len: usize) -> bool {
    limit > 0 && len > limit
}

#[derive(Debug, Clone)]
pub struct Gzip {
    level: Compression,
}

impl Gzip {
    pub fn new(level: u32) -> Self {
        Gzip {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for Gzip {
    fn default() -> Self {
        Gzip {
            level: Compression::default(),
        }
    }
}

impl TransferFilter for Gzip {
    fn id(&self) -> u8 {
        GZIP_ID
    }

    fn name(&self) -> &str {
        "gzip"
    }

    fn on_pack(&self, src: Bytes) -> Result<Bytes, Status> {
        let mut enc = GzEncoder::new(Vec::with_capacity(src.len() / 2 + 32), self.level);
        enc.write_all(&src)
            .and_then(|_| enc.finish())
            .map(Bytes::from)
            .map_err(|e| Status::internal(format!("gzip compress: {}", e)))
    }

    fn on_unpack(&self, src: Bytes, limit: usize) -> Result<Bytes, Status> {
        let cap = if limit > 0 { limit as u64 + 1 } else { u64::MAX };
        let mut out = Vec::with_capacity(src.len() * 2);
        GzDecoder::new(src.as_ref())
            .take(cap)
            .read_to_end(&mut out)
            .map_err(|e| Status::bad_message(format!("gzip decompress: {}", e)))?;
        if exceeds(limit, out.len()) {
            return Err(Status::bad_message(format!(
                "gzip decompress: body exceeds {} bytes",
                limit
            )));
        }
        Ok(Bytes::from(out))
    }
}

/// Filters known to an endpoint, keyed by id. Built before traffic flows.
#[derive(Clone)]
pub struct FilterRegistry {
    filters: HashMap<u8, Arc<dyn TransferFilter>>,
}

lazy_static! {
    static ref DEFAULT_REGISTRY: Arc<FilterRegistry> = Arc::new(FilterRegistry::default());
}

impl FilterRegistry {
    /// Registry without any filter.
    pub fn empty() -> Self {
        FilterRegistry {
            filters: HashMap::new(),
        }
    }

    /// Shared immutable registry holding the built-in filters.
    pub fn shared_default() -> Arc<FilterRegistry> {
        DEFAULT_REGISTRY.clone()
    }

    pub fn register(&mut self, filter: Arc<dyn TransferFilter>) -> Result<(), Status> {
        let id = filter.id();
        if let Some(existing) = self.filters.get(&id) {
            return Err(Status::with_code(Code::CONFLICT).with_cause(format!(
                "filter id {:?} already used by {}",
                id as char,
                existing.name()
            )));
        }
        self.filters.insert(id, filter);
        Ok(())
    }

    pub fn get(&self, id: u8) -> Result<&Arc<dyn TransferFilter>, Status> {
        self.filters.get(&id).ok_or_else(|| {
            Status::with_code(Code::UNSUPPORTED_TX)
                .with_cause(format!("unsupported filter id {:?}", id as char))
        })
    }

    pub fn contains(&self, id: u8) -> bool {
        self.filters.contains_key(&id)
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        let mut filters: HashMap<u8, Arc<dyn TransferFilter>> = HashMap::new();
        filters.insert(GZIP_ID, Arc::new(Gzip::default()));
        FilterRegistry { filters }
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<char> = self.filters.keys().map(|id| *id as char).collect();
        ids.sort_unstable();
        f.debug_struct("FilterRegistry").field("ids", &ids).finish()
    }
}

/// Ordered chain of filter ids attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipeTFilter {
    ids: Vec<u8>,
}

impl PipeTFilter {
    pub fn new() -> Self {
        PipeTFilter::default()
    }

    pub fn from_ids(ids: &[u8]) -> Self {
        PipeTFilter { ids: ids.to_vec() }
    }

    pub fn append(&mut self, id: u8) {
        self.ids.push(id);
    }

    pub fn ids(&self) -> &[u8] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn reset(&mut self) {
        self.ids.clear();
    }

    /// Apply the chain in order.
    pub fn on_pack(&self, registry: &FilterRegistry, mut data: Bytes) -> Result<Bytes, Status> {
        for id in &self.ids {
            data = registry.get(*id)?.on_pack(data)?;
        }
        Ok(data)
    }

    /// Undo the chain, last filter first. Every stage is bounded by `limit`
    /// (zero means unbounded).
    pub fn on_unpack(
        &self,
        registry: &FilterRegistry,
        mut data: Bytes,
        limit: usize,
    ) -> Result<Bytes, Status> {
        for id in self.ids.iter().rev() {
            let filter = registry.get(*id)?;
            data = filter.on_unpack(data, limit)?;
            if exceeds(limit, data.len()) {
                return Err(Status::bad_message(format!(
                    "{} output exceeds {} bytes",
                    filter.name(),
                    limit
                )));
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // appends its tag on pack and strips it on unpack, failing on mismatch
    struct Tag(u8);

    impl TransferFilter for Tag {
        fn id(&self) -> u8 {
            self.0
        }

        fn name(&self) -> &str {
            "tag"
        }

        fn on_pack(&self, src: Bytes) -> Result<Bytes, Status> {
            let mut v = src.to_vec();
            v.push(self.0);
            Ok(Bytes::from(v))
        }

        fn on_unpack(&self, src: Bytes, _limit: usize) -> Result<Bytes, Status> {
            match src.last() {
                Some(last) if *last == self.0 => Ok(src.slice(..src.len() - 1)),
                _ => Err(Status::bad_message(format!("expected tag {}", self.0 as char))),
            }
        }
    }

    fn registry() -> FilterRegistry {
        let mut reg = FilterRegistry::default();
        reg.register(Arc::new(Tag(b'a'))).unwrap();
        reg.register(Arc::new(Tag(b'b'))).unwrap();
        reg
    }

    #[test]
    fn test_order_is_reversed_on_unpack() {
        let reg = registry();
        let pipe = PipeTFilter::from_ids(b"ab");

        let packed = pipe.on_pack(&reg, Bytes::from_static(b"body")).unwrap();
        assert_eq!(packed.as_ref(), b"bodyab");
        assert_eq!(
            pipe.on_unpack(&reg, packed.clone(), 0).unwrap().as_ref(),
            b"body"
        );

        // unpacking with the wrong order hits a tag mismatch
        let swapped = PipeTFilter::from_ids(b"ba");
        assert!(swapped.on_unpack(&reg, packed, 0).is_err());
    }

    #[test]
    fn test_empty_chain_passes_through() {
        let reg = FilterRegistry::empty();
        let pipe = PipeTFilter::new();
        let data = Bytes::from_static(b"same");
        assert_eq!(pipe.on_pack(&reg, data.clone()).unwrap(), data);
        assert_eq!(pipe.on_unpack(&reg, data.clone(), 0).unwrap(), data);
    }

    #[test]
    fn test_gzip_round_trip() {
        let reg = FilterRegistry::default();
        let pipe = PipeTFilter::from_ids(&[GZIP_ID]);
        let data = Bytes::from(vec![b'z'; 4096]);
        let packed = pipe.on_pack(&reg, data.clone()).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(pipe.on_unpack(&reg, packed, 0).unwrap(), data);

        let err = pipe
            .on_unpack(&reg, Bytes::from_static(b"not gzip"), 0)
            .unwrap_err();
        assert_eq!(err.code(), Code::BAD_MESSAGE);
    }

    #[test]
    fn test_gzip_output_is_bounded() {
        let reg = FilterRegistry::default();
        let pipe = PipeTFilter::from_ids(&[GZIP_ID]);
        let data = Bytes::from(vec![0u8; 4 << 20]);
        let packed = pipe.on_pack(&reg, data.clone()).unwrap();
        assert!(packed.len() < 64 << 10);

        let err = pipe.on_unpack(&reg, packed.clone(), 1 << 20).unwrap_err();
        assert_eq!(err.code(), Code::BAD_MESSAGE);
        assert!(err.cause().unwrap().contains("exceeds 1048576 bytes"));

        // exactly at the limit is fine
        assert_eq!(pipe.on_unpack(&reg, packed, 4 << 20).unwrap(), data);
    }

    #[test]
    fn test_unknown_and_duplicate_ids() {
        let mut reg = FilterRegistry::empty();
        let pipe = PipeTFilter::from_ids(&[GZIP_ID]);
        let err = pipe.on_pack(&reg, Bytes::new()).unwrap_err();
        assert_eq!(err.code(), Code::UNSUPPORTED_TX);

        reg.register(Arc::new(Gzip::new(9))).unwrap();
        let err = reg.register(Arc::new(Gzip::default())).unwrap_err();
        assert_eq!(err.code(), Code::CONFLICT);
    }
}
