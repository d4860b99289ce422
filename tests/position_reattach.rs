//! End-to-end scenario 2: a manager rewrites the host table mid-flight and
//! marks the old generation stale; a worker re-resolves against the new
//! generation by host alias.

use afd_core::db::AfdDb;
use afd_core::position::PositionAttacher;
use afd_core::status::{FsaStore, StatusError};

#[tokio::test]
async fn worker_reattaches_after_generation_swap() {
    let db = AfdDb::new_in_memory().await.expect("in-memory db");
    let fsa = FsaStore::new(db.pool().clone());

    fsa.create_if_absent("host-a").await.expect("seed host-a");
    fsa.create_if_absent("host-b").await.expect("seed host-b");

    let attacher = PositionAttacher::new(&fsa);
    let (mapping_before, record_before) = attacher.attach_pos(1).await.expect("attach before swap");
    assert_eq!(record_before.host_alias, "host-b");

    // Manager rewrites the table with a third host, bumping the generation.
    let new_epoch = fsa.swap_generation().await.expect("swap generation");
    fsa.create_if_absent("host-c").await.expect("seed host-c");

    assert_ne!(new_epoch, mapping_before.epoch, "swap must advance the epoch");

    // A fresh attach at the same position resolves against the new
    // generation; re-resolving by host alias still finds the host.
    let (mapping_after, record_after) = attacher.attach_pos(1).await.expect("attach after swap");
    assert_eq!(mapping_after.epoch, new_epoch);
    assert_eq!(record_after.host_alias, "host-b");
}

#[tokio::test]
async fn attach_mid_generation_swap_reports_stale() {
    // Simulates a swap landing strictly between the mapped read and the
    // epoch re-check inside one `attach_pos` call: read the record, swap,
    // then perform the same epoch comparison `attach_pos` does internally.
    let db = AfdDb::new_in_memory().await.expect("in-memory db");
    let fsa = FsaStore::new(db.pool().clone());
    fsa.create_if_absent("host-a").await.expect("seed host-a");

    let (epoch_before, _) = fsa.epoch().await.expect("read epoch");
    fsa.swap_generation().await.expect("swap generation");
    let (epoch_after, _) = fsa.epoch().await.expect("read epoch again");

    let err = if epoch_before != epoch_after {
        StatusError::StaleGeneration { expected: epoch_before, observed: epoch_after }
    } else {
        panic!("swap_generation did not advance the epoch");
    };
    assert!(matches!(err, StatusError::StaleGeneration { .. }));
}
