//! Property tests: random operation sequences against one store must keep
//! the usage cache, the authority and the tree in agreement.

mod common;

use common::Harness;
use proptest::prelude::*;
use sandstore_core::{CopyOrMoveMode, ObfuscatedStore, StoreError, VirtualPath};

const PATHS: &[&str] = &["a", "b", "a/x", "b/y", "a/x/z"];
const QUOTA: i64 = 200;

#[cfg(feature = "stress")]
const CASES: u32 = 512;
#[cfg(not(feature = "stress"))]
const CASES: u32 = 32;

#[derive(Debug, Clone)]
enum Op {
    CreateDir(usize, bool),
    EnsureFile(usize),
    Truncate(usize, u64),
    CopyOrMove(usize, usize, bool),
    DeleteFile(usize),
    DeleteDir(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let path = 0..PATHS.len();
    prop_oneof![
        (path.clone(), any::<bool>()).prop_map(|(p, recursive)| Op::CreateDir(p, recursive)),
        path.clone().prop_map(Op::EnsureFile),
        (path.clone(), 0u64..120).prop_map(|(p, len)| Op::Truncate(p, len)),
        (path.clone(), path.clone(), any::<bool>()).prop_map(|(s, d, is_move)| Op::CopyOrMove(s, d, is_move)),
        path.clone().prop_map(Op::DeleteFile),
        path.prop_map(Op::DeleteDir),
    ]
}

async fn apply(store: &mut ObfuscatedStore, op: &Op) -> Result<(), StoreError> {
    let at = |i: usize| VirtualPath::new(PATHS[i]);
    match *op {
        Op::CreateDir(p, recursive) => store.create_directory(&at(p), false, recursive).await,
        Op::EnsureFile(p) => store.ensure_file_exists(&at(p)).await.map(|_| ()),
        Op::Truncate(p, len) => store.truncate(&at(p), len).await,
        Op::CopyOrMove(s, d, is_move) => {
            let mode = if is_move { CopyOrMoveMode::Move } else { CopyOrMoveMode::Copy };
            store.copy_or_move_file(&at(s), &at(d), mode).await
        }
        Op::DeleteFile(p) => store.delete_file(&at(p)).await,
        Op::DeleteDir(p) => store.delete_directory(&at(p)).await,
    }
}

/// Sum of file sizes reachable from the root.
async fn tree_bytes(store: &mut ObfuscatedStore) -> i64 {
    let mut total = 0;
    let mut pending = vec![VirtualPath::root()];
    while let Some(dir) = pending.pop() {
        for entry in store.read_directory(&dir).await.unwrap() {
            if entry.is_directory {
                pending.push(dir.join(&entry.name));
            } else {
                total += entry.size as i64;
            }
        }
    }
    total
}

fn is_engine_failure(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::FatalInconsistency { .. } | StoreError::Corruption { .. } | StoreError::Io { .. }
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(CASES))]

    /// Every step keeps cached usage, authority usage and actual bytes equal
    /// and under quota, and leaves nothing for the checker to repair.
    #[test]
    fn usage_is_conserved_across_random_operations(ops in prop::collection::vec(op_strategy(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let h = Harness::without_path_cost(QUOTA);
            let mut store = h.open().await;

            for op in &ops {
                if let Err(err) = apply(&mut store, op).await {
                    prop_assert!(!is_engine_failure(&err), "{:?} failed: {}", op, err);
                }
                prop_assert!(!store.needs_consistency_check());
                let usage = store.usage().await.unwrap();
                prop_assert!(usage <= QUOTA, "usage {} over quota after {:?}", usage, op);
                prop_assert_eq!(usage, tree_bytes(&mut store).await);
                prop_assert_eq!(usage, h.authority_usage().await);
            }

            let report = store.check_consistency().await.unwrap();
            prop_assert_eq!(report.removed_entries, 0);
            prop_assert_eq!(report.deleted_orphans, 0);
            let recomputed = store.usage().await.unwrap();
            prop_assert_eq!(recomputed, tree_bytes(&mut store).await);
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Creating then deleting the same files returns usage to zero.
    #[test]
    fn create_then_delete_returns_to_empty(sizes in prop::collection::vec(0u64..40, 1..5)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let h = Harness::new(1 << 20);
            let mut store = h.open().await;
            let names: Vec<_> = (0..sizes.len()).map(|i| VirtualPath::new(format!("f{i}"))).collect();

            for (name, size) in names.iter().zip(&sizes) {
                store.ensure_file_exists(name).await.unwrap();
                store.truncate(name, *size).await.unwrap();
            }
            prop_assert!(store.usage().await.unwrap() > 0);

            for name in &names {
                store.delete_file(name).await.unwrap();
            }
            prop_assert_eq!(store.usage().await.unwrap(), 0);
            prop_assert_eq!(h.authority_usage().await, 0);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
