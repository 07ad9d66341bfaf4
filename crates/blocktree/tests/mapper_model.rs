// Model-based check: random byte-range operation sequences applied both to
// the mapper and to a plain in-memory byte array must never disagree, and
// blocks the model says are all zero must not exist on the store after a
// flush.

use std::sync::Arc;

use block_codec::{Codec, Compressor};
use blocktree::{BlockMapper, BlockTree, CacheLimits, TreeOptions};
use cloud_store::{MemStore, ObjectStore};
use proptest::prelude::*;
use stratus_core::keys::{derive_pass_key, DataKey};

const BS: u32 = 512;
const VOLUME: usize = 16 * BS as usize; // 16 blocks

#[derive(Debug, Clone)]
enum Op {
    Write { offset: usize, fill: u8, len: usize },
    Trim { offset: usize, len: usize },
    Read { offset: usize, len: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let bounded = |len_cap: usize| (0..VOLUME, 1..len_cap);
    prop_oneof![
        (bounded(2048), any::<u8>()).prop_map(|((offset, len), fill)| {
            Op::Write { offset, fill, len: len.min(VOLUME - offset) }
        }),
        bounded(4096).prop_map(|(offset, len)| Op::Trim { offset, len: len.min(VOLUME - offset) }),
        bounded(4096).prop_map(|(offset, len)| Op::Read { offset, len: len.min(VOLUME - offset) }),
    ]
}

fn mapper() -> (MemStore, BlockMapper) {
    let mut store = MemStore::new();
    store.check_access().unwrap();
    let codec =
        Codec::new(derive_pass_key("pw"), Some(DataKey::from([4u8; 32])), Compressor::Deflate);
    let tree = BlockTree::new(
        codec,
        Box::new(store.clone()),
        TreeOptions { writer_threads: 2, read_ahead: 0 },
    );
    tree.set_cache_limits(CacheLimits { total: 8, queue: 4, flush: 1 });
    tree.start().unwrap();
    (store, BlockMapper::new(Arc::new(tree), BS))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn mapper_agrees_with_a_flat_buffer(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let (store, mapper) = mapper();
        let mut model = vec![0u8; VOLUME];

        for op in &ops {
            match *op {
                Op::Write { offset, fill, len } => {
                    let data = vec![fill; len];
                    mapper.write(offset as u64, &data).unwrap();
                    model[offset..offset + len].copy_from_slice(&data);
                }
                Op::Trim { offset, len } => {
                    mapper.trim(offset as u64, len as u64).unwrap();
                    model[offset..offset + len].fill(0);
                }
                Op::Read { offset, len } => {
                    let got = mapper.read(offset as u64, len).unwrap();
                    prop_assert_eq!(&got[..], &model[offset..offset + len]);
                }
            }
        }

        mapper.flush();
        let full = mapper.read(0, VOLUME).unwrap();
        prop_assert_eq!(&full[..], &model[..]);

        // stable-zero: a block whose model contents are all zero must have
        // no object on the store; a non-zero one must
        for block in 0..(VOLUME / BS as usize) {
            let slice = &model[block * BS as usize..(block + 1) * BS as usize];
            let stored = store.get(&stratus_core::block_path(block as u64)).unwrap().is_some();
            prop_assert_eq!(stored, slice.iter().any(|&b| b != 0), "block {}", block);
        }
    }
}
