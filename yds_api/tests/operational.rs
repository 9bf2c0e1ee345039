//! Operational datastore tests: provider pulls, disjointness, stored
//! operational edits and kind filtering.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use yds_api::{
    Connection, ConnOptions, Datastore, DataNode, GetOperOptions, OperSubType, Repository,
    SchemaModule, SchemaNode, Session, SubOptions, Subscription,
};

fn setup(tmp: &tempfile::TempDir) -> Repository {
    let repo = Repository::with_root(tmp.path()).unwrap();
    let mut schema = SchemaModule::new("m", "2024-01-01");
    schema.nodes = vec![
        SchemaNode::leaf("config-only", yds_api::ValueType::String),
        SchemaNode::container("state")
            .with_children(vec![SchemaNode::leaf("counter", yds_api::ValueType::Uint64).state()])
            .state(),
    ];
    let conn = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    conn.install_module(schema).unwrap();
    drop(conn);
    repo
}

#[test]
fn test_provider_merged_with_config() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = setup(&tmp);

    let prov_conn = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    let prov_sess = Session::start(&prov_conn, Datastore::Operational);
    let mut subscription = Subscription::new(&prov_sess, SubOptions::empty()).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = Arc::clone(&calls);
        subscription
            .oper_get_subscribe(
                &prov_sess,
                "m",
                "/m:state/counter",
                OperSubType::State,
                SubOptions::empty(),
                Box::new(move |_xpath, _request| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let mut state = DataNode::new("state");
                    state.children.push(DataNode::leaf("counter", "42"));
                    Ok(vec![state])
                }),
            )
            .unwrap();
    }

    let rd_conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let mut rd_sess = Session::start(&rd_conn, Datastore::Running);
    rd_sess.set_item("/m:config-only", Some("cfg")).unwrap();
    rd_sess.apply_changes(5000).unwrap();

    rd_sess.switch_datastore(Datastore::Operational);
    let all = rd_sess.get_data("/m:*").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let counter = all
        .find_one(&yds_data::path::Path::parse("/m:state/counter").unwrap())
        .unwrap();
    assert_eq!(counter.value.as_deref(), Some("42"));
    let cfg = all
        .find_one(&yds_data::path::Path::parse("/m:config-only").unwrap())
        .unwrap();
    assert_eq!(cfg.value.as_deref(), Some("cfg"));

    // A statically disjoint request never invokes the provider.
    let only_cfg = rd_sess.get_data("/m:config-only").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(
        only_cfg
            .find_one(&yds_data::path::Path::parse("/m:config-only").unwrap())
            .is_some()
    );

    drop(subscription);
}

#[test]
fn test_get_oper_option_filters() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = setup(&tmp);

    let prov_conn = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    let prov_sess = Session::start(&prov_conn, Datastore::Operational);
    let mut subscription = Subscription::new(&prov_sess, SubOptions::empty()).unwrap();
    subscription
        .oper_get_subscribe(
            &prov_sess,
            "m",
            "/m:state/counter",
            OperSubType::State,
            SubOptions::empty(),
            Box::new(|_, _| {
                let mut state = DataNode::new("state");
                state.children.push(DataNode::leaf("counter", "7"));
                Ok(vec![state])
            }),
        )
        .unwrap();

    let rd_conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let mut rd_sess = Session::start(&rd_conn, Datastore::Running);
    rd_sess.set_item("/m:config-only", Some("cfg")).unwrap();
    rd_sess.apply_changes(5000).unwrap();
    rd_sess.switch_datastore(Datastore::Operational);

    // NO_SUBS: providers skipped entirely.
    let no_subs = rd_sess
        .get_data_opts("/m:*", GetOperOptions::NO_SUBS, 5000)
        .unwrap();
    assert!(
        no_subs
            .find_one(&yds_data::path::Path::parse("/m:state/counter").unwrap())
            .is_none()
    );

    // NO_STATE: state providers skipped, config kept.
    let no_state = rd_sess
        .get_data_opts("/m:*", GetOperOptions::NO_STATE, 5000)
        .unwrap();
    assert!(
        no_state
            .find_one(&yds_data::path::Path::parse("/m:state/counter").unwrap())
            .is_none()
    );
    assert!(
        no_state
            .find_one(&yds_data::path::Path::parse("/m:config-only").unwrap())
            .is_some()
    );

    drop(subscription);
}

#[test]
fn test_stored_operational_edits() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = setup(&tmp);

    let conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let mut sess = Session::start(&conn, Datastore::Running);
    sess.set_item("/m:config-only", Some("cfg")).unwrap();
    sess.apply_changes(5000).unwrap();

    // An operational edit shadows the running value without touching it.
    sess.switch_datastore(Datastore::Operational);
    sess.set_item("/m:config-only", Some("oper-override")).unwrap();
    sess.apply_changes(5000).unwrap();

    assert_eq!(
        sess.get_item("/m:config-only").unwrap().value.as_deref(),
        Some("oper-override")
    );
    // NO_STORED yields the plain running view.
    let plain = sess
        .get_data_opts("/m:config-only", GetOperOptions::NO_STORED, 5000)
        .unwrap();
    assert_eq!(
        plain
            .find_one(&yds_data::path::Path::parse("/m:config-only").unwrap())
            .unwrap()
            .value
            .as_deref(),
        Some("cfg")
    );
    sess.switch_datastore(Datastore::Running);
    assert_eq!(
        sess.get_item("/m:config-only").unwrap().value.as_deref(),
        Some("cfg")
    );
}
