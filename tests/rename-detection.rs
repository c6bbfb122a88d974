//! A rename on one device becomes a rename on the other - no bytes move.

mod common;

use common::*;
use zisync::meta::FileStatus;

#[test]
fn rename_travels_as_metadata_only() {
    let a = Peer::start("alice");
    let b = Peer::start("bob");
    link(&a, &b);
    let (sync, a_tree, b_tree) = make_sync(&a, &b, "photos");

    let payload = vec![7u8; 128 * 1024];
    write_file(&a_tree.root, "/before.jpg", &payload);
    a.engine.sync_once(&sync).unwrap();
    assert_eq!(visible_files(&b_tree.root), vec!["/before.jpg"]);

    std::fs::rename(
        a_tree.root.join("before.jpg"),
        a_tree.root.join("after.jpg"),
    )
    .unwrap();

    let bytes_before = a.engine.query_tree_status(&a_tree.uuid).bytes_transferred;
    a.engine.sync_once(&sync).unwrap();
    let bytes_after = a.engine.query_tree_status(&a_tree.uuid).bytes_transferred;

    // Bob followed the rename...
    assert_eq!(visible_files(&b_tree.root), vec!["/after.jpg"]);
    assert_eq!(
        read_file(&b_tree.root, "/after.jpg").as_deref(),
        Some(payload.as_slice())
    );
    // ...the old path is a tombstone on both sides...
    for (peer, tree) in [(&a, &a_tree), (&b, &b_tree)] {
        let row = peer.store(&tree.uuid).get("/before.jpg").unwrap().unwrap();
        assert_eq!(row.status, FileStatus::Removed);
        let new_row = peer.store(&tree.uuid).get("/after.jpg").unwrap().unwrap();
        assert_eq!(new_row.status, FileStatus::Normal);
    }
    // ...and no file bytes crossed the wire for it.
    assert_eq!(bytes_before, bytes_after);

    a.shutdown();
    b.shutdown();
}

#[test]
fn drifted_rename_target_falls_back_to_a_copy() {
    let a = Peer::start("alice");
    let b = Peer::start("bob");
    link(&a, &b);
    let (sync, a_tree, b_tree) = make_sync(&a, &b, "notes");

    write_file(&a_tree.root, "/old.md", b"original text");
    a.engine.sync_once(&sync).unwrap();

    // Alice renames; meanwhile Bob's copy of the old file is edited, so
    // Bob can't satisfy the rename locally.
    std::fs::rename(a_tree.root.join("old.md"), a_tree.root.join("new.md")).unwrap();
    let b_old = write_file(&b_tree.root, "/old.md", b"bob scribbled here");
    bump_mtime(&b_old, 2);
    b.engine.index_once(&b_tree.uuid).unwrap();

    a.engine.sync_once(&sync).unwrap();
    // Alice's view of /old.md is a conflicting delete against Bob's edit;
    // either way /new.md must exist with the original bytes eventually.
    a.engine.sync_once(&sync).unwrap();
    b.engine.sync_once(&sync).unwrap();

    assert_eq!(
        read_file(&b_tree.root, "/new.md").as_deref(),
        Some(b"original text".as_slice())
    );
    assert_eq!(
        read_file(&a_tree.root, "/new.md").as_deref(),
        Some(b"original text".as_slice())
    );

    a.shutdown();
    b.shutdown();
}
