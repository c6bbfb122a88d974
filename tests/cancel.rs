//! Cancellation mid-transfer leaves no trace: no staging, no partial
//! file, no metadata row.

mod common;

use common::*;
use zisync::errors::Error;

#[test]
fn cancelled_pull_leaves_nothing_behind() {
    let a = Peer::start("alice");
    let b = Peer::start("bob");
    link(&a, &b);
    let (sync, a_tree, b_tree) = make_sync(&a, &b, "big");

    // Big enough that a throttled pull takes ages.
    let payload = vec![42u8; 8 * 1024 * 1024];
    write_file(&a_tree.root, "/huge.bin", &payload);
    a.engine.index_once(&a_tree.uuid).unwrap();

    b.engine.set_download_limit(64 * 1024).unwrap();

    let result = std::thread::scope(|scope| {
        let puller = scope.spawn(|| b.engine.sync_once(&sync));

        // Wait for bytes to start flowing, then pull the plug mid-body.
        eventually(
            || b.engine.query_tree_status(&b_tree.uuid).bytes_transferred > 0,
            "the pull to start moving bytes",
        );
        std::thread::sleep(std::time::Duration::from_millis(200));
        b.engine.cancel_tree(&b_tree.uuid);
        puller.join().expect("puller panicked")
    });
    assert!(
        matches!(result, Err(Error::Cancelled)),
        "expected a cancelled sync, got {result:?}"
    );

    // No staging session, no partial canonical file, no metadata row.
    assert_eq!(staging_leftovers(&b_tree.root), Vec::<String>::new());
    assert_eq!(read_file(&b_tree.root, "/huge.bin"), None);
    assert!(b.store(&b_tree.uuid).get("/huge.bin").unwrap().is_none());

    // And the cancel isn't sticky once the user resumes.
    b.engine.resume_tree(&b_tree.uuid);
    b.engine.set_download_limit(0).unwrap();
    b.engine.sync_once(&sync).unwrap();
    assert_eq!(
        read_file(&b_tree.root, "/huge.bin").map(|b| b.len()),
        Some(payload.len())
    );

    a.shutdown();
    b.shutdown();
}
