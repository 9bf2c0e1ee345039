//! Notification tests: live delivery, suspension, replay from the log and
//! stop-time finalization.

use std::sync::Arc;
use parking_lot::Mutex;
use yds_api::{
    Connection, ConnOptions, Datastore, DataNode, NotifType, Repository, SchemaModule,
    SchemaNode, Session, SubOptions, Subscription,
};
use yds_sub::notif_log::now_ts;

fn setup(tmp: &tempfile::TempDir) -> Repository {
    let repo = Repository::with_root(tmp.path()).unwrap();
    let mut schema = SchemaModule::new("n", "2024-01-01");
    schema.nodes = vec![SchemaNode {
        name: "alarm".to_string(),
        kind: yds_api::NodeKind::Notification,
        config: true,
        leafref: None,
        if_feature: None,
        children: vec![SchemaNode::leaf("severity", yds_api::ValueType::String)],
    }];
    let conn = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    conn.install_module(schema).unwrap();
    drop(conn);
    repo
}

fn alarm(severity: &str) -> DataNode {
    let mut n = DataNode::new("alarm");
    n.children.push(DataNode::leaf("severity", severity));
    n
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(25));
    }
    panic!("Timed out waiting for {}", what);
}

type NotifLog = Arc<Mutex<Vec<(NotifType, Option<String>)>>>;

fn recording_cb(log: &NotifLog) -> yds_sub::listen::NotifCallback {
    let log = Arc::clone(log);
    Box::new(move |kind, _ts, notif| {
        let severity = notif.and_then(|n| {
            n.find_child("severity", &[])
                .and_then(|s| s.value.clone())
        });
        log.lock().push((kind, severity));
    })
}

#[test]
fn test_live_notification_delivery() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = setup(&tmp);

    let sub_conn = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    let sub_sess = Session::start(&sub_conn, Datastore::Running);
    let mut subscription = Subscription::new(&sub_sess, SubOptions::empty()).unwrap();
    let log: NotifLog = Arc::new(Mutex::new(Vec::new()));
    subscription
        .notif_subscribe(&sub_sess, "n", None, None, recording_cb(&log))
        .unwrap();

    let send_conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let send_sess = Session::start(&send_conn, Datastore::Running);
    send_sess.notif_send("n", &alarm("major")).unwrap();

    wait_until("the live notification", || !log.lock().is_empty());
    let events = log.lock().clone();
    assert_eq!(
        events,
        vec![(NotifType::Realtime, Some("major".to_string()))]
    );

    drop(subscription);
}

#[test]
fn test_replay_then_live() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = setup(&tmp);

    let conn = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    conn.set_replay_support("n", true).unwrap();

    let send_sess = Session::start(&conn, Datastore::Running);
    send_sess.notif_send("n", &alarm("one")).unwrap();
    send_sess.notif_send("n", &alarm("two")).unwrap();

    // Subscribe with a start time in the past: logged notifications come
    // first, then the replay-complete marker, then live ones.
    let sub_conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let sub_sess = Session::start(&sub_conn, Datastore::Running);
    let mut subscription = Subscription::new(&sub_sess, SubOptions::empty()).unwrap();
    let log: NotifLog = Arc::new(Mutex::new(Vec::new()));
    subscription
        .notif_subscribe(&sub_sess, "n", Some(now_ts() - 3600), None, recording_cb(&log))
        .unwrap();

    wait_until("the replay to finish", || {
        log.lock()
            .iter()
            .any(|(kind, _)| *kind == NotifType::ReplayComplete)
    });

    send_sess.notif_send("n", &alarm("three")).unwrap();
    wait_until("the live notification", || {
        log.lock().iter().any(|(_, sev)| sev.as_deref() == Some("three"))
    });

    let events = log.lock().clone();
    assert_eq!(
        events,
        vec![
            (NotifType::Replay, Some("one".to_string())),
            (NotifType::Replay, Some("two".to_string())),
            (NotifType::ReplayComplete, None),
            (NotifType::Realtime, Some("three".to_string())),
        ]
    );

    drop(subscription);
}

#[test]
fn test_elapsed_stop_time_completes_immediately() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = setup(&tmp);

    let conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let sess = Session::start(&conn, Datastore::Running);
    let mut subscription = Subscription::new(&sess, SubOptions::empty()).unwrap();
    let log: NotifLog = Arc::new(Mutex::new(Vec::new()));
    subscription
        .notif_subscribe(&sess, "n", None, Some(now_ts() - 1), recording_cb(&log))
        .unwrap();

    wait_until("the stop event", || {
        log.lock().iter().any(|(kind, _)| *kind == NotifType::Stop)
    });

    // Notifications after the stop are not delivered.
    sess.notif_send("n", &alarm("late")).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(200));
    assert!(
        log.lock()
            .iter()
            .all(|(_, sev)| sev.as_deref() != Some("late"))
    );

    drop(subscription);
}

#[test]
fn test_suspended_subscription_skips_delivery() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = setup(&tmp);

    let sub_conn = Connection::connect_to(repo.clone(), ConnOptions::empty()).unwrap();
    let sub_sess = Session::start(&sub_conn, Datastore::Running);
    let mut subscription = Subscription::new(&sub_sess, SubOptions::empty()).unwrap();
    let log: NotifLog = Arc::new(Mutex::new(Vec::new()));
    let sub_id = subscription
        .notif_subscribe(&sub_sess, "n", None, None, recording_cb(&log))
        .unwrap();

    sub_conn.set_notif_suspended("n", sub_id, true).unwrap();

    let send_conn = Connection::connect_to(repo, ConnOptions::empty()).unwrap();
    let send_sess = Session::start(&send_conn, Datastore::Running);
    send_sess.notif_send("n", &alarm("silent")).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(300));
    assert!(log.lock().is_empty());

    sub_conn.set_notif_suspended("n", sub_id, false).unwrap();
    send_sess.notif_send("n", &alarm("loud")).unwrap();
    wait_until("the resumed delivery", || !log.lock().is_empty());
    assert_eq!(
        log.lock().clone(),
        vec![(NotifType::Realtime, Some("loud".to_string()))]
    );

    drop(subscription);
}
