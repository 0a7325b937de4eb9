//! Concurrent pack index construction.
//!
//! The teacher resolves deltas lazily, one read at a time, against an
//! index that's assumed to already exist. Building that index in the
//! first place — from nothing but the raw pack bytes, in one pass over a
//! stream that can't be re-read — is a different problem with no teacher
//! equivalent: every object's identifier has to be computed, but a delta's
//! identifier can't be known until its base has been expanded, and a
//! base's own identifier might not be known yet either.
//!
//! Construction happens in two passes:
//!
//! - **Pass 1** (serial, forward-only): walk the pack once, computing each
//!   frame's CRC32 and absolute offset. Non-delta objects are hashed and
//!   interned immediately. Delta frames can't be resolved yet — they're
//!   recorded into a pending graph keyed by the base they're waiting on,
//!   either an offset (OFS_DELTA) or an identifier (REF_DELTA, which may
//!   reference a base outside this pack).
//! - **Pass 2** (concurrent): starting from every object pass 1 already
//!   resolved, a bounded worker pool walks the pending graph breadth-first,
//!   applying each ready delta, hashing the result, interning it, and
//!   freeing up its own children to be resolved in turn.
//!
//! Any delta frame still pending once the graph is exhausted means a
//! REF_DELTA pointed at a base this pack (and the resolver it was given)
//! never produced — that's reported as an error, not silently dropped.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use flate2::bufread::ZlibDecoder;

use crate::delta::apply::apply_delta;
use crate::delta::delta_object_size;
use crate::entry::parse_entry_header;
use crate::{
    PackEntryType, PackError, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION,
};
use gitr_hash::ObjectId;
use gitr_object::ObjectType;

/// Largest inflated object size this builder will accept, checked before
/// any base is resolved (so an adversarial delta can't be used to force a
/// huge allocation downstream).
pub const MAX_OBJECT_SIZE: u64 = 16 * 1024 * 1024;

/// Default number of worker threads used by pass 2.
pub const DEFAULT_WORKERS: usize = 2;

/// One fully resolved entry produced by the builder.
#[derive(Debug, Clone)]
pub struct BuiltEntry {
    pub oid: ObjectId,
    pub offset: u64,
    pub crc32: u32,
    pub obj_type: ObjectType,
}

/// A delta frame recorded in pass 1, not yet resolved.
struct PendingDelta {
    offset: u64,
    crc32: u32,
    delta_data: Vec<u8>,
}

/// Resolves REF_DELTA bases that live outside the pack being indexed (e.g.
/// a thin pack applied against an existing object database).
pub trait ExternalBaseResolver: Sync {
    fn resolve(&self, oid: &ObjectId) -> Option<(ObjectType, Vec<u8>)>;
}

impl ExternalBaseResolver for () {
    fn resolve(&self, _oid: &ObjectId) -> Option<(ObjectType, Vec<u8>)> {
        None
    }
}

/// Build a full OID index for `pack_data`, resolving every object
/// (including the full delta chain) to its identifier, type, and offset.
pub fn build_index(pack_data: &[u8]) -> Result<(Vec<BuiltEntry>, ObjectId), PackError> {
    build_index_with_resolver(pack_data, &(), DEFAULT_WORKERS)
}

/// Same as [`build_index`], but with a custom worker count and an external
/// base resolver for REF_DELTA entries this pack doesn't itself contain.
pub fn build_index_with_resolver(
    pack_data: &[u8],
    external: &dyn ExternalBaseResolver,
    workers: usize,
) -> Result<(Vec<BuiltEntry>, ObjectId), PackError> {
    let (resolved, pending_offset, pending_id, trailer) = scan_pack(pack_data)?;

    let state = SharedState {
        resolved: Mutex::new(resolved),
        pending_by_offset: Mutex::new(pending_offset),
        pending_by_id: Mutex::new(pending_id),
        queue: Mutex::new(Vec::new()),
        outstanding: AtomicUsize::new(0),
        error: Mutex::new(None),
    };

    // Seed the BFS queue with everything pass 1 already resolved.
    {
        let resolved = state.resolved.lock().unwrap();
        let mut queue = state.queue.lock().unwrap();
        queue.extend(resolved.values().map(|e| (e.offset, e.oid)));
        state.outstanding.fetch_add(queue.len(), Ordering::SeqCst);
    }

    run_workers(&state, pack_data, external, workers.max(1));

    if let Some(err) = state.error.lock().unwrap().take() {
        return Err(err);
    }

    let pending_offset = state.pending_by_offset.lock().unwrap();
    let pending_id = state.pending_by_id.lock().unwrap();
    if !pending_offset.is_empty() || !pending_id.is_empty() {
        let unresolved = pending_offset.len() + pending_id.values().map(|v| v.len()).sum::<usize>();
        return Err(PackError::InvalidIndex(format!(
            "{unresolved} delta entries never resolved to a base"
        )));
    }

    let resolved = state.resolved.into_inner().unwrap();
    let mut entries: Vec<BuiltEntry> = resolved.into_values().collect();
    entries.sort_by(|a, b| a.oid.cmp(&b.oid));

    Ok((entries, trailer))
}

struct SharedState {
    resolved: Mutex<HashMap<u64, BuiltEntry>>,
    pending_by_offset: Mutex<HashMap<u64, Vec<PendingDelta>>>,
    pending_by_id: Mutex<HashMap<ObjectId, Vec<PendingDelta>>>,
    /// Breadth-first work queue: (offset, oid) of a resolved object whose
    /// dependents (if any) haven't been chased down yet.
    queue: Mutex<Vec<(u64, ObjectId)>>,
    /// Items pushed onto `queue` but not yet finished processing (queued
    /// plus in-flight). Workers only stop once this reaches zero with the
    /// queue empty — a queue that's momentarily empty doesn't mean the
    /// graph is exhausted, another worker may be about to push more.
    outstanding: AtomicUsize,
    error: Mutex<Option<PackError>>,
}

fn run_workers(
    state: &SharedState,
    pack_data: &[u8],
    external: &dyn ExternalBaseResolver,
    workers: usize,
) {
    crossbeam::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(move |_| worker_loop(state, pack_data, external));
        }
    })
    .expect("worker thread panicked");
}

fn worker_loop(state: &SharedState, pack_data: &[u8], external: &dyn ExternalBaseResolver) {
    loop {
        if state.error.lock().unwrap().is_some() {
            return;
        }

        let Some((offset, oid)) = pop_work(state) else {
            if state.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            // Queue is momentarily empty but other workers still have
            // in-flight items that may enqueue this item's dependents.
            std::thread::yield_now();
            continue;
        };

        let result = resolve_children(state, pack_data, external, offset, oid);
        state.outstanding.fetch_sub(1, Ordering::SeqCst);

        if let Err(err) = result {
            let mut slot = state.error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
            return;
        }
    }
}

fn pop_work(state: &SharedState) -> Option<(u64, ObjectId)> {
    state.queue.lock().unwrap().pop()
}

fn resolve_children(
    state: &SharedState,
    pack_data: &[u8],
    external: &dyn ExternalBaseResolver,
    base_offset: u64,
    base_oid: ObjectId,
) -> Result<(), PackError> {
    let base_type = {
        let resolved = state.resolved.lock().unwrap();
        resolved
            .get(&base_offset)
            .map(|e| e.obj_type)
            .expect("caller only enqueues resolved offsets")
    };

    let waiting_on_offset = take_pending(&state.pending_by_offset, &base_offset);
    let waiting_on_id = take_pending(&state.pending_by_id, &base_oid);

    if waiting_on_offset.is_empty() && waiting_on_id.is_empty() {
        return Ok(());
    }

    // Each recursion gets its own inflated base buffer — never shared
    // mutably across workers walking different branches of the graph.
    let base_data = read_base_bytes(state, pack_data, external, base_offset, &base_oid)?;

    let mut newly_resolved = Vec::with_capacity(waiting_on_offset.len() + waiting_on_id.len());
    for pending in waiting_on_offset.into_iter().chain(waiting_on_id) {
        let target_data = apply_delta(&base_data, &pending.delta_data)?;
        let oid = gitr_hash::hasher::Hasher::hash_object(
            std::str::from_utf8(base_type.as_bytes()).expect("object type is ascii"),
            &target_data,
        )?;

        let entry = BuiltEntry {
            oid,
            offset: pending.offset,
            crc32: pending.crc32,
            obj_type: base_type,
        };
        state
            .resolved
            .lock()
            .unwrap()
            .insert(pending.offset, entry);
        newly_resolved.push((pending.offset, oid));
    }

    // Bump the outstanding count before these become visible in the queue,
    // so no worker can observe an empty queue and zero outstanding while
    // these are still in flight between the two locks.
    if !newly_resolved.is_empty() {
        state
            .outstanding
            .fetch_add(newly_resolved.len(), Ordering::SeqCst);
        state.queue.lock().unwrap().extend(newly_resolved);
    }

    Ok(())
}

fn take_pending<K: std::hash::Hash + Eq + Copy>(
    map: &Mutex<HashMap<K, Vec<PendingDelta>>>,
    key: &K,
) -> Vec<PendingDelta> {
    let mut guard: MutexGuard<HashMap<K, Vec<PendingDelta>>> = map.lock().unwrap();
    guard.remove(key).unwrap_or_default()
}

fn read_base_bytes(
    state: &SharedState,
    pack_data: &[u8],
    external: &dyn ExternalBaseResolver,
    base_offset: u64,
    base_oid: &ObjectId,
) -> Result<Vec<u8>, PackError> {
    let already = state.resolved.lock().unwrap().contains_key(&base_offset);
    if already {
        return decompress_frame_at(pack_data, base_offset);
    }
    external
        .resolve(base_oid)
        .map(|(_, data)| data)
        .ok_or(PackError::MissingBase(*base_oid))
}

fn decompress_frame_at(pack_data: &[u8], offset: u64) -> Result<Vec<u8>, PackError> {
    let entry = parse_entry_header(&pack_data[offset as usize..], offset)?;
    let compressed = &pack_data[entry.data_offset as usize..];
    let mut decoder = ZlibDecoder::new(compressed);
    let mut out = Vec::with_capacity(entry.uncompressed_size);
    decoder
        .read_to_end(&mut out)
        .map_err(|_| PackError::CorruptEntry(offset))?;
    Ok(out)
}

/// Pass 1: serial walk computing CRC32s, interning non-delta objects, and
/// recording delta frames into the pending graph.
#[allow(clippy::type_complexity)]
fn scan_pack(
    pack_data: &[u8],
) -> Result<
    (
        HashMap<u64, BuiltEntry>,
        HashMap<u64, Vec<PendingDelta>>,
        HashMap<ObjectId, Vec<PendingDelta>>,
        ObjectId,
    ),
    PackError,
> {
    if pack_data.len() < PACK_HEADER_SIZE {
        return Err(PackError::InvalidHeader("file too small".into()));
    }
    if &pack_data[0..4] != PACK_SIGNATURE {
        return Err(PackError::InvalidHeader("bad PACK signature".into()));
    }
    let version = u32::from_be_bytes([pack_data[4], pack_data[5], pack_data[6], pack_data[7]]);
    if version != PACK_VERSION {
        return Err(PackError::UnsupportedVersion(version));
    }
    let num_objects = u32::from_be_bytes([
        pack_data[8],
        pack_data[9],
        pack_data[10],
        pack_data[11],
    ]);

    if pack_data.len() < gitr_hash::HASH_LEN {
        return Err(PackError::InvalidHeader("missing pack trailer".into()));
    }
    let content_len = pack_data.len() - gitr_hash::HASH_LEN;
    let trailer_bytes = &pack_data[content_len..];
    let expected_trailer = ObjectId::from_bytes(trailer_bytes)?;

    let mut hasher = gitr_hash::hasher::Hasher::new();
    hasher.update(&pack_data[..content_len]);
    let actual_trailer = hasher.finalize()?;
    if actual_trailer != expected_trailer {
        return Err(PackError::ChecksumMismatch {
            expected: expected_trailer,
            actual: actual_trailer,
        });
    }

    let mut resolved = HashMap::new();
    let mut pending_offset: HashMap<u64, Vec<PendingDelta>> = HashMap::new();
    let mut pending_id: HashMap<ObjectId, Vec<PendingDelta>> = HashMap::new();

    let mut offset = PACK_HEADER_SIZE as u64;
    for _ in 0..num_objects {
        let entry = parse_entry_header(&pack_data[offset as usize..], offset)?;
        let compressed = &pack_data[entry.data_offset as usize..];

        let mut decoder = ZlibDecoder::new(compressed);
        let mut data = Vec::with_capacity(entry.uncompressed_size.min(MAX_OBJECT_SIZE as usize));
        if entry.uncompressed_size as u64 > MAX_OBJECT_SIZE {
            return Err(PackError::InvalidDelta {
                offset,
                reason: format!("object exceeds {MAX_OBJECT_SIZE} byte cap"),
            });
        }
        decoder
            .read_to_end(&mut data)
            .map_err(|_| PackError::CorruptEntry(offset))?;
        if data.len() != entry.uncompressed_size {
            return Err(PackError::InvalidDelta {
                offset,
                reason: "inflated size does not match header".into(),
            });
        }
        let consumed_compressed = decoder.total_in();

        let frame_end = entry.data_offset + consumed_compressed;
        let crc32 = crc32fast::hash(&pack_data[offset as usize..frame_end as usize]);

        match entry.entry_type {
            PackEntryType::Commit | PackEntryType::Tree | PackEntryType::Blob | PackEntryType::Tag => {
                let obj_type = entry.entry_type.to_object_type().expect("non-delta type");
                let oid = gitr_hash::hasher::Hasher::hash_object(
                    std::str::from_utf8(obj_type.as_bytes()).expect("object type is ascii"),
                    &data,
                )?;
                resolved.insert(
                    offset,
                    BuiltEntry {
                        oid,
                        offset,
                        crc32,
                        obj_type,
                    },
                );
            }
            PackEntryType::OfsDelta { base_offset } => {
                if data.len() as u64 > MAX_OBJECT_SIZE {
                    return Err(PackError::InvalidDelta {
                        offset,
                        reason: format!("delta exceeds {MAX_OBJECT_SIZE} byte cap"),
                    });
                }
                let target_size = delta_object_size(&data)? as u64;
                if target_size > MAX_OBJECT_SIZE {
                    return Err(PackError::InvalidDelta {
                        offset,
                        reason: format!("delta target exceeds {MAX_OBJECT_SIZE} byte cap"),
                    });
                }
                pending_offset.entry(base_offset).or_default().push(PendingDelta {
                    offset,
                    crc32,
                    delta_data: data,
                });
            }
            PackEntryType::RefDelta { base_oid } => {
                let target_size = delta_object_size(&data)? as u64;
                if target_size > MAX_OBJECT_SIZE {
                    return Err(PackError::InvalidDelta {
                        offset,
                        reason: format!("delta target exceeds {MAX_OBJECT_SIZE} byte cap"),
                    });
                }
                pending_id.entry(base_oid).or_default().push(PendingDelta {
                    offset,
                    crc32,
                    delta_data: data,
                });
            }
        }

        offset = frame_end;
    }

    Ok((resolved, pending_offset, pending_id, expected_trailer))
}
