//! Crash recovery tests: a connection whose lockfile probe fails is
//! reclaimed by the next engine entry taking a write lock.

use yds_api::{
    Connection, ConnOptions, Datastore, Repository, SchemaModule, SchemaNode, Session,
    SubOptions, Subscription, ValueType, YdsError,
};

fn setup(tmp: &tempfile::TempDir) -> Repository {
    let repo = Repository::with_root(tmp.path()).unwrap();
    let mut schema = SchemaModule::new("m", "2024-01-01");
    schema.nodes = vec![SchemaNode::leaf("x", ValueType::String)];
    let conn = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    conn.install_module(schema).unwrap();
    drop(conn);
    repo
}

/// Make a live connection look dead: without its lockfile, the liveness
/// probe reports no holder, exactly as after a SIGKILL.
fn simulate_crash(repo: &Repository, conn: &Connection) {
    std::fs::remove_file(repo.conn_lock_path(conn.cid())).unwrap();
}

#[test]
fn test_dead_connection_subscriptions_disappear() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = setup(&tmp);

    let crashed = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    let crashed_sess = Session::start(&crashed, Datastore::Running);
    let mut subscription = Subscription::new(&crashed_sess, SubOptions::empty()).unwrap();
    subscription
        .module_change_subscribe(
            &crashed_sess,
            "m",
            None,
            0,
            SubOptions::empty(),
            Box::new(|_| Ok(None)),
        )
        .unwrap();

    simulate_crash(&repo, &crashed);

    // The next connect sweeps the corpse; a writer then commits without
    // waiting for the vanished subscriber.
    let conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let mut sess = Session::start(&conn, Datastore::Running);
    sess.set_item("/m:x", Some("v")).unwrap();
    let started = std::time::Instant::now();
    sess.apply_changes(2000).unwrap();
    assert!(started.elapsed() < std::time::Duration::from_millis(1500));
    assert_eq!(sess.get_item("/m:x").unwrap().value.as_deref(), Some("v"));

    // Keep the crashed connection alive in memory until the end so its
    // listener thread does not interfere with the assertion above.
    std::mem::forget(subscription);
    std::mem::forget(crashed);
}

#[test]
fn test_dead_connection_ds_lock_released() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = setup(&tmp);

    let crashed = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    let crashed_sess = Session::start(&crashed, Datastore::Running);
    crashed_sess.lock(Some("m")).unwrap();
    simulate_crash(&repo, &crashed);

    let conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let other = Session::start(&conn, Datastore::Running);
    other.lock(Some("m")).unwrap();
    other.unlock(Some("m")).unwrap();

    std::mem::forget(crashed_sess);
    std::mem::forget(crashed);
}

#[test]
fn test_live_connection_is_left_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = setup(&tmp);

    let live = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    let live_sess = Session::start(&live, Datastore::Running);
    live_sess.lock(Some("m")).unwrap();

    // A fresh connect (which sweeps) must not steal a live lock.
    let conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let other = Session::start(&conn, Datastore::Running);
    assert!(matches!(
        other.lock(Some("m")).unwrap_err(),
        YdsError::LockFailed { .. }
    ));

    live_sess.unlock(Some("m")).unwrap();
}
