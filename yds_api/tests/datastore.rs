//! End-to-end datastore tests: install, commit, read-back, defaults,
//! candidate handling and datastore locks.

use yds_api::{
    Connection, ConnOptions, Datastore, EditOp, Repository, SchemaModule, SchemaNode, Session,
    ValueType, YdsError,
};

fn test_repo(tmp: &tempfile::TempDir) -> Repository {
    Repository::with_root(tmp.path()).unwrap()
}

fn server_schema() -> SchemaModule {
    let mut m = SchemaModule::new("srv", "2024-01-01");
    m.nodes = vec![
        SchemaNode::leaf("x", ValueType::String),
        SchemaNode::container("server").with_children(vec![
            SchemaNode::leaf("port", ValueType::Uint64).with_default("8080"),
            SchemaNode::list("listen", vec!["name".to_string()])
                .with_children(vec![SchemaNode::leaf("address", ValueType::String)]),
        ]),
    ];
    m
}

fn install(repo: &Repository, schema: SchemaModule) {
    let conn = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    conn.install_module(schema).unwrap();
    drop(conn);
}

#[test]
fn test_single_writer_commit() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repo(&tmp);
    install(&repo, server_schema());

    let conn_a = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    let conn_b = Connection::connect_to(repo.clone(), ConnOptions::CACHE_RUNNING).unwrap();

    let mut sess_a = Session::start(&conn_a, Datastore::Running);
    sess_a.set_item("/srv:x", Some("hi")).unwrap();
    assert!(sess_a.has_changes());
    sess_a.apply_changes(5000).unwrap();
    assert!(!sess_a.has_changes());

    let sess_b = Session::start(&conn_b, Datastore::Running);
    let item = sess_b.get_item("/srv:x").unwrap();
    assert_eq!(item.value.as_deref(), Some("hi"));

    // Cached read returns the same committed value.
    let item = sess_b.get_item("/srv:x").unwrap();
    assert_eq!(item.value.as_deref(), Some("hi"));

    // A second commit invalidates B's cache.
    sess_a.set_item("/srv:x", Some("bye")).unwrap();
    sess_a.apply_changes(5000).unwrap();
    let item = sess_b.get_item("/srv:x").unwrap();
    assert_eq!(item.value.as_deref(), Some("bye"));
}

#[test]
fn test_defaults_are_materialized() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repo(&tmp);
    install(&repo, server_schema());

    let conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let sess = Session::start(&conn, Datastore::Running);
    let port = sess.get_item("/srv:server/port").unwrap();
    assert_eq!(port.value.as_deref(), Some("8080"));
    assert!(port.dflt);
}

#[test]
fn test_validation_rejects_bad_value() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repo(&tmp);
    install(&repo, server_schema());

    let conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let mut sess = Session::start(&conn, Datastore::Running);
    sess.set_item("/srv:server/port", Some("not-a-port")).unwrap();
    let err = sess.apply_changes(5000).unwrap_err();
    assert!(matches!(err, YdsError::ValidationFailed { .. }));

    // Nothing was persisted; the edit is still pending for a retry.
    assert!(sess.has_changes());
    sess.discard_changes();
    let port = sess.get_item("/srv:server/port").unwrap();
    assert_eq!(port.value.as_deref(), Some("8080"));
}

#[test]
fn test_create_and_delete_semantics() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repo(&tmp);
    install(&repo, server_schema());

    let conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let mut sess = Session::start(&conn, Datastore::Running);

    sess.edit_item("/srv:x", Some("a"), EditOp::Create).unwrap();
    sess.apply_changes(5000).unwrap();

    // Creating again must fail, the edit stays pending.
    sess.edit_item("/srv:x", Some("b"), EditOp::Create).unwrap();
    assert!(matches!(
        sess.apply_changes(5000).unwrap_err(),
        YdsError::Exists { .. }
    ));
    sess.discard_changes();

    // Strict delete of a missing node fails; remove tolerates it.
    sess.edit_item("/srv:server/listen[name='a']", None, EditOp::Delete)
        .unwrap();
    assert!(matches!(
        sess.apply_changes(5000).unwrap_err(),
        YdsError::NotFound { .. }
    ));
    sess.discard_changes();
    sess.delete_item("/srv:server/listen[name='a']").unwrap();
    sess.apply_changes(5000).unwrap();
}

#[test]
fn test_list_instances() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repo(&tmp);
    install(&repo, server_schema());

    let conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let mut sess = Session::start(&conn, Datastore::Running);
    sess.set_item("/srv:server/listen[name='http']/address", Some("::1"))
        .unwrap();
    sess.set_item("/srv:server/listen[name='https']/address", Some("::2"))
        .unwrap();
    sess.apply_changes(5000).unwrap();

    let data = sess.get_data("/srv:server/listen").unwrap();
    let hits = data.find(&yds_data::path::Path::parse("/srv:server/listen").unwrap());
    assert_eq!(hits.len(), 2);

    let one = sess
        .get_item("/srv:server/listen[name='https']/address")
        .unwrap();
    assert_eq!(one.value.as_deref(), Some("::2"));
}

#[test]
fn test_startup_and_running_are_independent() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repo(&tmp);
    install(&repo, server_schema());

    let conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let mut sess = Session::start(&conn, Datastore::Running);
    sess.set_item("/srv:x", Some("running-only")).unwrap();
    sess.apply_changes(5000).unwrap();

    sess.switch_datastore(Datastore::Startup);
    assert!(sess.get_item("/srv:x").is_err());

    // Copying running into startup makes them equal again.
    sess.copy_config(Datastore::Running, None, 5000).unwrap();
    let item = sess.get_item("/srv:x").unwrap();
    assert_eq!(item.value.as_deref(), Some("running-only"));
}

#[test]
fn test_candidate_falls_back_to_running() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repo(&tmp);
    install(&repo, server_schema());

    let conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let mut sess = Session::start(&conn, Datastore::Running);
    sess.set_item("/srv:x", Some("base")).unwrap();
    sess.apply_changes(5000).unwrap();

    // An unmodified candidate mirrors running.
    sess.switch_datastore(Datastore::Candidate);
    assert_eq!(sess.get_item("/srv:x").unwrap().value.as_deref(), Some("base"));

    // A modified candidate diverges without touching running.
    sess.set_item("/srv:x", Some("draft")).unwrap();
    sess.apply_changes(5000).unwrap();
    assert_eq!(sess.get_item("/srv:x").unwrap().value.as_deref(), Some("draft"));
    sess.switch_datastore(Datastore::Running);
    assert_eq!(sess.get_item("/srv:x").unwrap().value.as_deref(), Some("base"));
}

#[test]
fn test_datastore_lock_excludes_other_sessions() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repo(&tmp);
    install(&repo, server_schema());

    let conn = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    let mut locker = Session::start(&conn, Datastore::Running);
    let mut other = Session::start(&conn, Datastore::Running);

    locker.lock(Some("srv")).unwrap();

    // A competing lock and a competing write both fail.
    assert!(matches!(
        other.lock(Some("srv")).unwrap_err(),
        YdsError::LockFailed { .. }
    ));
    other.set_item("/srv:x", Some("nope")).unwrap();
    assert!(matches!(
        other.apply_changes(5000).unwrap_err(),
        YdsError::LockFailed { .. }
    ));
    other.discard_changes();

    // The owner itself can write, and unlock reopens the datastore.
    locker.set_item("/srv:x", Some("mine")).unwrap();
    locker.apply_changes(5000).unwrap();
    locker.unlock(Some("srv")).unwrap();
    other.set_item("/srv:x", Some("yours")).unwrap();
    other.apply_changes(5000).unwrap();
}

#[test]
fn test_module_removal_is_scheduled() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = test_repo(&tmp);
    install(&repo, server_schema());

    let conn = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    conn.remove_module("srv").unwrap();
    // Still visible on this connection.
    assert!(conn.get_module("srv").is_some());
    drop(conn);

    // The next connect applies the removal.
    let conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    assert!(conn.get_module("srv").is_none());
    let sess = Session::start(&conn, Datastore::Running);
    assert!(matches!(
        sess.get_data("/srv:x").unwrap_err(),
        YdsError::NotFound { .. }
    ));
}
