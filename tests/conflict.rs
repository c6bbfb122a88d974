//! Concurrent edits: nobody's bytes get silently thrown away.

mod common;

use common::*;

#[test]
fn concurrent_edits_keep_both_versions() {
    let a = Peer::start("alice");
    let b = Peer::start("bob");
    link(&a, &b);
    let (sync, a_tree, b_tree) = make_sync(&a, &b, "shared");

    // A common ancestor on both sides.
    let a_file = write_file(&a_tree.root, "/report.txt", b"base");
    a.engine.sync_once(&sync).unwrap();
    assert_eq!(
        read_file(&b_tree.root, "/report.txt").as_deref(),
        Some(b"base".as_slice())
    );

    // Partitioned, both edit. Each side indexes its own change (the
    // watcher would do this for real deployments).
    write_file(&a_tree.root, "/report.txt", b"from-a");
    bump_mtime(&a_file, 2);
    let b_file = write_file(&b_tree.root, "/report.txt", b"from-b");
    bump_mtime(&b_file, 3);
    a.engine.index_once(&a_tree.uuid).unwrap();
    b.engine.index_once(&b_tree.uuid).unwrap();

    // Reconnect. Alice pulls the conflicting edit; her own version is
    // preserved under a conflict name.
    a.engine.sync_once(&sync).unwrap();
    assert_eq!(
        read_file(&a_tree.root, "/report.txt").as_deref(),
        Some(b"from-b".as_slice())
    );
    assert_eq!(
        read_file(&a_tree.root, "/report.conflict.txt").as_deref(),
        Some(b"from-a".as_slice())
    );

    // Another round indexes the conflict copy and carries the merged
    // result everywhere: both sides converge, both versions survive.
    a.engine.sync_once(&sync).unwrap();
    assert_eq!(
        read_file(&b_tree.root, "/report.txt").as_deref(),
        Some(b"from-b".as_slice())
    );
    assert_eq!(
        read_file(&b_tree.root, "/report.conflict.txt").as_deref(),
        Some(b"from-a".as_slice())
    );

    // And the merged history is settled: nothing further to do.
    let before = a.engine.query_tree_status(&a_tree.uuid);
    a.engine.sync_once(&sync).unwrap();
    let after = a.engine.query_tree_status(&a_tree.uuid);
    assert_eq!(before.bytes_transferred, after.bytes_transferred);

    a.shutdown();
    b.shutdown();
}

#[test]
fn conflict_names_step_past_taken_ones() {
    let a = Peer::start("alice");
    let b = Peer::start("bob");
    link(&a, &b);
    let (sync, a_tree, b_tree) = make_sync(&a, &b, "shared");

    let a_file = write_file(&a_tree.root, "/report.txt", b"base");
    a.engine.sync_once(&sync).unwrap();

    // The first conflict name is already taken by an ordinary file.
    write_file(&a_tree.root, "/report.conflict.txt", b"innocent bystander");

    write_file(&a_tree.root, "/report.txt", b"from-a");
    bump_mtime(&a_file, 2);
    let b_file = write_file(&b_tree.root, "/report.txt", b"from-b");
    bump_mtime(&b_file, 3);
    a.engine.index_once(&a_tree.uuid).unwrap();
    b.engine.index_once(&b_tree.uuid).unwrap();

    a.engine.sync_once(&sync).unwrap();
    assert_eq!(
        read_file(&a_tree.root, "/report.conflict.txt").as_deref(),
        Some(b"innocent bystander".as_slice())
    );
    assert_eq!(
        read_file(&a_tree.root, "/report.conflict.1.txt").as_deref(),
        Some(b"from-a".as_slice())
    );
    a.shutdown();
    b.shutdown();
}
