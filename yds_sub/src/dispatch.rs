//! Event dispatch: the originator side of every slot protocol.
//!
//! Change events run the multi-phase protocol per module: update (collect
//! amending edits), change (veto point), then done or abort, each phase
//! delivered to descending priority bands with fan-in counting. Oper and
//! RPC events are request/reply; notifications are fire-and-forget.

use crate::evpipe;
use crate::slot::{EventCode, SubSlot, path_hash};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use yds_common::{Datastore, LockMode, Repository, Sid, SubOptions, YdsError, YdsResult};
use yds_data::diff::DiffTree;
use yds_data::edit::Edit;
use yds_data::lyb;
use yds_data::tree::DataNode;
use yds_shm::layout::NotifSubShm;
use yds_shm::mod_sub::{ChangeSub, RpcSub};

/// Timeout for acquiring slot locks.
const SLOT_LOCK_TIMEOUT_MS: u32 = 1000;
/// How long a notification waits for the previous event to be consumed.
const NOTIF_FREE_TIMEOUT_MS: u32 = 2000;

/// Error reported by a subscriber callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CbError {
    /// Subscriber-supplied message.
    pub msg: String,
    /// Offending path, if reported.
    pub xpath: Option<String>,
}

/// Payload of Update/Change/Done/Abort/Enabled events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePayload {
    /// Forward diff of the module.
    pub diff: DiffTree,
}

/// Success reply of an Update event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateReply {
    /// Amending edit to merge into the originator's edit.
    pub edit: Edit,
}

/// Payload of an Oper event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperPayload {
    /// Subscribed path being pulled.
    pub xpath: String,
    /// Path the reader actually asked for.
    pub request_xpath: String,
    /// Existing data parent to append under.
    pub parent: Vec<DataNode>,
}

/// Success reply of an Oper event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperReply {
    /// Provided subtree(s).
    pub data: Vec<DataNode>,
}

/// Payload of an Rpc event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcPayload {
    /// Operation tree with input.
    pub input: DataNode,
}

/// Success reply of an Rpc event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    /// Operation tree with output.
    pub output: DataNode,
}

/// Payload of a Notif event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifPayload {
    /// Notification timestamp (seconds since the epoch).
    pub timestamp: u64,
    /// Notification tree.
    pub notif: DataNode,
}

/// Slot file of module change subscriptions in one datastore.
pub fn change_slot_path(repo: &Repository, module: &str, ds: Datastore) -> PathBuf {
    repo.sub_shm_path(module, &format!("change.{}", ds.file_suffix()), None)
}

/// Slot file of one operational subscription.
pub fn oper_slot_path(repo: &Repository, module: &str, xpath: &str) -> PathBuf {
    repo.sub_shm_path(module, "oper", Some(path_hash(xpath)))
}

/// Slot file of one RPC/action operation.
pub fn rpc_slot_path(repo: &Repository, module: &str, op_path: &str) -> PathBuf {
    repo.sub_shm_path(module, "rpc", Some(path_hash(op_path)))
}

/// Slot file of module notifications.
pub fn notif_slot_path(repo: &Repository, module: &str) -> PathBuf {
    repo.sub_shm_path(module, "notif", None)
}

/// Distinct priorities, descending.
fn priority_bands(priorities: impl Iterator<Item = u32>) -> Vec<u32> {
    let mut bands: Vec<u32> = priorities.collect();
    bands.sort_unstable_by(|a, b| b.cmp(a));
    bands.dedup();
    bands
}

fn kick_band(repo: &Repository, subs: &[&ChangeSub], band: u32) -> YdsResult<()> {
    for sub in subs.iter().filter(|s| s.rec.priority == band) {
        evpipe::notify(repo, sub.rec.evpipe_num, evpipe::TOKEN_EVENT)?;
    }
    Ok(())
}

fn is_passive(sub: &ChangeSub) -> bool {
    SubOptions::from_bits_truncate(sub.rec.opts).contains(SubOptions::PASSIVE)
}

/// Wait for the originator-facing outcome of `request_id`; on timeout the
/// event is stamped Error so in-flight subscribers stop.
fn wait_for_reply(
    slot: &mut SubSlot,
    request_id: u32,
    timeout_ms: u32,
    what: &str,
) -> YdsResult<Option<CbError>> {
    let waited = slot.wait(timeout_ms, |ev, rid| rid == request_id && ev.is_notify());
    if waited.is_err() {
        slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
        if slot.request_id() == request_id && slot.event().is_listen() {
            let err = CbError {
                msg: format!("{} event timed out.", what),
                xpath: None,
            };
            let payload = lyb::encode_payload(&err)?;
            slot.write_reply(EventCode::Error, &payload)?;
        }
        slot.unlock(LockMode::Write);
        return Err(YdsError::TimeOut {
            msg: format!("{} event", what),
        });
    }

    slot.lock(LockMode::Read, SLOT_LOCK_TIMEOUT_MS)?;
    let outcome = match slot.event() {
        EventCode::Error => {
            let err: CbError = lyb::decode_payload(slot.payload()).unwrap_or(CbError {
                msg: "Unknown subscriber error.".to_string(),
                xpath: None,
            });
            Some(err)
        }
        _ => None,
    };
    slot.unlock(LockMode::Read);
    Ok(outcome)
}

/// Drive the Update phase: deliver the diff to `SUB_UPDATE` subscribers in
/// descending priority bands and collect their amending edits. Returns the
/// merged edit and the first callback error, if any.
pub fn change_notify_update(
    repo: &Repository,
    module: &str,
    ds: Datastore,
    subs: &[ChangeSub],
    diff: &DiffTree,
    sid: Sid,
    timeout_ms: u32,
) -> YdsResult<(Edit, Option<CbError>)> {
    let upd: Vec<&ChangeSub> = subs
        .iter()
        .filter(|s| SubOptions::from_bits_truncate(s.rec.opts).contains(SubOptions::UPDATE))
        .collect();
    let mut merged = Edit::new();
    if upd.is_empty() {
        return Ok((merged, None));
    }

    let mut slot = SubSlot::open(&change_slot_path(repo, module, ds), true)?;
    let payload = lyb::encode_payload(&ChangePayload { diff: diff.clone() })?;

    for band in priority_bands(upd.iter().filter(|s| !is_passive(s)).map(|s| s.rec.priority)) {
        let count = upd
            .iter()
            .filter(|s| s.rec.priority == band && !is_passive(s))
            .count() as u32;

        slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
        let request_id = slot.request_id() + 1;
        slot.write_event_multi(request_id, band, count, EventCode::Update, sid, &payload)?;
        slot.unlock(LockMode::Write);
        kick_band(repo, &upd, band)?;

        if let Some(err) = wait_for_reply(&mut slot, request_id, timeout_ms, "Update")? {
            return Ok((merged, Some(err)));
        }

        slot.lock(LockMode::Read, SLOT_LOCK_TIMEOUT_MS)?;
        if !slot.payload().is_empty() {
            if let Ok(reply) = lyb::decode_payload::<UpdateReply>(slot.payload()) {
                merged.merge(reply.edit);
            }
        }
        slot.unlock(LockMode::Read);
    }
    Ok((merged, None))
}

/// Drive the Change phase. On a callback error, returns it together with
/// the failing priority band so the caller can abort everything at that
/// priority and above.
pub fn change_notify_change(
    repo: &Repository,
    module: &str,
    ds: Datastore,
    subs: &[ChangeSub],
    diff: &DiffTree,
    sid: Sid,
    timeout_ms: u32,
) -> YdsResult<(u32, Option<(CbError, u32)>)> {
    let chg: Vec<&ChangeSub> = subs
        .iter()
        .filter(|s| {
            !SubOptions::from_bits_truncate(s.rec.opts).contains(SubOptions::DONE_ONLY)
        })
        .collect();
    let mut slot = SubSlot::open(&change_slot_path(repo, module, ds), true)?;
    let mut request_id = {
        slot.lock(LockMode::Read, SLOT_LOCK_TIMEOUT_MS)?;
        let rid = slot.request_id();
        slot.unlock(LockMode::Read);
        rid
    };
    if chg.is_empty() {
        return Ok((request_id, None));
    }

    let payload = lyb::encode_payload(&ChangePayload { diff: diff.clone() })?;
    request_id += 1;

    for band in priority_bands(chg.iter().filter(|s| !is_passive(s)).map(|s| s.rec.priority)) {
        let count = chg
            .iter()
            .filter(|s| s.rec.priority == band && !is_passive(s))
            .count() as u32;

        slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
        slot.write_event_multi(request_id, band, count, EventCode::Change, sid, &payload)?;
        slot.unlock(LockMode::Write);
        kick_band(repo, &chg, band)?;

        match wait_for_reply(&mut slot, request_id, timeout_ms, "Change") {
            Ok(None) => {}
            Ok(Some(err)) => return Ok((request_id, Some((err, band)))),
            Err(e) => {
                // Timeout counts as a failure of this band.
                let err = CbError {
                    msg: e.to_string(),
                    xpath: None,
                };
                return Ok((request_id, Some((err, band))));
            }
        }
    }
    Ok((request_id, None))
}

fn change_notify_finish(
    repo: &Repository,
    module: &str,
    ds: Datastore,
    subs: &[ChangeSub],
    diff: &DiffTree,
    sid: Sid,
    request_id: u32,
    event: EventCode,
    down_to_priority: Option<u32>,
) -> YdsResult<()> {
    let fin: Vec<&ChangeSub> = subs
        .iter()
        .filter(|s| {
            let opts = SubOptions::from_bits_truncate(s.rec.opts);
            match event {
                // Abort goes to everyone that saw the Change.
                EventCode::Abort => {
                    !opts.contains(SubOptions::DONE_ONLY)
                        && down_to_priority.is_none_or(|p| s.rec.priority >= p)
                }
                _ => true,
            }
        })
        .collect();
    if fin.is_empty() {
        return Ok(());
    }

    let mut slot = SubSlot::open(&change_slot_path(repo, module, ds), true)?;
    let payload = lyb::encode_payload(&ChangePayload { diff: diff.clone() })?;

    for band in priority_bands(fin.iter().filter(|s| !is_passive(s)).map(|s| s.rec.priority)) {
        let count = fin
            .iter()
            .filter(|s| s.rec.priority == band && !is_passive(s))
            .count() as u32;

        slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
        slot.write_event_multi(request_id, band, count, event, sid, &payload)?;
        slot.unlock(LockMode::Write);
        kick_band(repo, &fin, band)?;

        // Fire-and-forget, but let the band consume the slot before the
        // next band's event replaces it.
        let _ = slot.wait(NOTIF_FREE_TIMEOUT_MS, |ev, _| !ev.is_listen());
    }
    Ok(())
}

/// Drive the Done phase; fire-and-forget.
pub fn change_notify_done(
    repo: &Repository,
    module: &str,
    ds: Datastore,
    subs: &[ChangeSub],
    diff: &DiffTree,
    sid: Sid,
    request_id: u32,
) -> YdsResult<()> {
    change_notify_finish(repo, module, ds, subs, diff, sid, request_id, EventCode::Done, None)
}

/// Drive the Abort phase towards every subscriber that already saw the
/// failed Change (priority `down_to` and above); fire-and-forget, same
/// request id as the Change.
pub fn change_notify_abort(
    repo: &Repository,
    module: &str,
    ds: Datastore,
    subs: &[ChangeSub],
    diff: &DiffTree,
    sid: Sid,
    request_id: u32,
    down_to: u32,
) -> YdsResult<()> {
    change_notify_finish(
        repo,
        module,
        ds,
        subs,
        diff,
        sid,
        request_id,
        EventCode::Abort,
        Some(down_to),
    )
}

/// Pull operational data from one provider. Returns the provided subtree
/// or the provider's error.
pub fn oper_notify(
    repo: &Repository,
    module: &str,
    sub_xpath: &str,
    request_xpath: &str,
    parent: &[DataNode],
    sid: Sid,
    evpipe_num: u32,
    timeout_ms: u32,
) -> YdsResult<Result<Vec<DataNode>, CbError>> {
    let mut slot = SubSlot::open(&oper_slot_path(repo, module, sub_xpath), false)?;
    let payload = lyb::encode_payload(&OperPayload {
        xpath: sub_xpath.to_string(),
        request_xpath: request_xpath.to_string(),
        parent: parent.to_vec(),
    })?;

    slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
    let request_id = slot.request_id() + 1;
    slot.write_event(request_id, EventCode::Oper, sid, &payload)?;
    slot.unlock(LockMode::Write);
    evpipe::notify(repo, evpipe_num, evpipe::TOKEN_EVENT)?;

    if let Some(err) = wait_for_reply(&mut slot, request_id, timeout_ms, "Oper")? {
        return Ok(Err(err));
    }

    slot.lock(LockMode::Read, SLOT_LOCK_TIMEOUT_MS)?;
    let reply: OperReply = if slot.payload().is_empty() {
        OperReply::default()
    } else {
        lyb::decode_payload(slot.payload())?
    };
    slot.unlock(LockMode::Read);
    Ok(Ok(reply.data))
}

/// Invoke an RPC/action: the input travels down the priority chain, each
/// band may rewrite the output which is passed forward. Returns the final
/// output or the first subscriber error with the failing priority.
pub fn rpc_notify(
    repo: &Repository,
    module: &str,
    op_path: &str,
    subs: &[RpcSub],
    input: &DataNode,
    sid: Sid,
    timeout_ms: u32,
) -> YdsResult<(u32, Result<DataNode, (CbError, u32)>)> {
    let mut slot = SubSlot::open(&rpc_slot_path(repo, module, op_path), true)?;
    let mut current = input.clone();
    let mut request_id = {
        slot.lock(LockMode::Read, SLOT_LOCK_TIMEOUT_MS)?;
        let rid = slot.request_id();
        slot.unlock(LockMode::Read);
        rid
    };
    if subs.is_empty() {
        return Err(YdsError::NotFound {
            msg: format!("No subscriber for RPC \"{}\".", op_path),
        });
    }

    request_id += 1;
    for band in priority_bands(subs.iter().map(|s| s.rec.priority)) {
        let band_subs: Vec<&RpcSub> =
            subs.iter().filter(|s| s.rec.priority == band).collect();
        let payload = lyb::encode_payload(&RpcPayload {
            input: current.clone(),
        })?;

        slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
        slot.write_event_multi(
            request_id,
            band,
            band_subs.len() as u32,
            EventCode::Rpc,
            sid,
            &payload,
        )?;
        slot.unlock(LockMode::Write);
        for sub in &band_subs {
            evpipe::notify(repo, sub.rec.evpipe_num, evpipe::TOKEN_EVENT)?;
        }

        match wait_for_reply(&mut slot, request_id, timeout_ms, "RPC") {
            Ok(None) => {}
            Ok(Some(err)) => return Ok((request_id, Err((err, band)))),
            Err(e) => {
                let err = CbError {
                    msg: e.to_string(),
                    xpath: None,
                };
                return Ok((request_id, Err((err, band))));
            }
        }

        slot.lock(LockMode::Read, SLOT_LOCK_TIMEOUT_MS)?;
        if !slot.payload().is_empty() {
            if let Ok(reply) = lyb::decode_payload::<RpcReply>(slot.payload()) {
                current = reply.output;
            }
        }
        slot.unlock(LockMode::Read);
    }
    Ok((request_id, Ok(current)))
}

/// Abort an RPC towards bands that already processed it.
pub fn rpc_notify_abort(
    repo: &Repository,
    module: &str,
    op_path: &str,
    subs: &[RpcSub],
    input: &DataNode,
    sid: Sid,
    request_id: u32,
    down_to: u32,
) -> YdsResult<()> {
    let aborted: Vec<&RpcSub> = subs
        .iter()
        .filter(|s| s.rec.priority >= down_to)
        .collect();
    if aborted.is_empty() {
        return Ok(());
    }
    let mut slot = SubSlot::open(&rpc_slot_path(repo, module, op_path), true)?;
    let payload = lyb::encode_payload(&RpcPayload {
        input: input.clone(),
    })?;
    for band in priority_bands(aborted.iter().map(|s| s.rec.priority)) {
        let count = aborted.iter().filter(|s| s.rec.priority == band).count() as u32;
        slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
        slot.write_event_multi(request_id, band, count, EventCode::Abort, sid, &payload)?;
        slot.unlock(LockMode::Write);
        for sub in aborted.iter().filter(|s| s.rec.priority == band) {
            evpipe::notify(repo, sub.rec.evpipe_num, evpipe::TOKEN_EVENT)?;
        }
        let _ = slot.wait(NOTIF_FREE_TIMEOUT_MS, |ev, _| !ev.is_listen());
    }
    Ok(())
}

/// Deliver a notification to all non-suspended subscribers of a module.
/// Fire-and-forget; waits only for the previous event to be consumed.
pub fn notif_notify(
    repo: &Repository,
    module: &str,
    subs: &[NotifSubShm],
    timestamp: u64,
    notif: &DataNode,
    sid: Sid,
) -> YdsResult<()> {
    let live: Vec<&NotifSubShm> = subs.iter().filter(|s| s.suspended == 0).collect();
    if live.is_empty() {
        return Ok(());
    }

    let mut slot = SubSlot::open(&notif_slot_path(repo, module), true)?;
    // Let the previous notification drain first.
    let _ = slot.wait(NOTIF_FREE_TIMEOUT_MS, |ev, _| !ev.is_listen());

    let payload = lyb::encode_payload(&NotifPayload {
        timestamp,
        notif: notif.clone(),
    })?;
    slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
    let request_id = slot.request_id() + 1;
    slot.write_event_multi(request_id, 0, live.len() as u32, EventCode::Notif, sid, &payload)?;
    slot.unlock(LockMode::Write);

    for sub in live {
        evpipe::notify(repo, sub.evpipe_num, evpipe::TOKEN_EVENT)?;
    }
    Ok(())
}

/// Dismiss a pending event in a multi slot on behalf of one subscriber
/// that will never process it: consume its share of the fan-in and flip
/// the event to an empty Success when it was the last.
pub fn dismiss_multi(slot: &mut SubSlot) -> YdsResult<()> {
    slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
    if slot.event().is_listen() && slot.subscriber_count() > 0 {
        let remaining = slot.dec_subscriber_count();
        if remaining == 0 {
            let terminal = match slot.event() {
                EventCode::Update | EventCode::Change | EventCode::Enabled => EventCode::Success,
                _ => EventCode::None,
            };
            slot.write_reply(terminal, &[])?;
        }
    }
    slot.unlock(LockMode::Write);
    Ok(())
}

/// Dismiss a pending event in a single-subscriber slot.
pub fn dismiss_single(slot: &mut SubSlot) -> YdsResult<()> {
    slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
    if slot.event().is_listen() {
        slot.write_reply(EventCode::Success, &[])?;
    }
    slot.unlock(LockMode::Write);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bands_descending() {
        assert_eq!(priority_bands([10, 20, 10, 0].into_iter()), vec![20, 10, 0]);
        assert!(priority_bands(std::iter::empty()).is_empty());
    }

    #[test]
    fn test_slot_paths_differ_per_topic() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Repository::with_root(tmp.path()).unwrap();
        let a = change_slot_path(&repo, "m", Datastore::Running);
        let b = change_slot_path(&repo, "m", Datastore::Startup);
        let c = oper_slot_path(&repo, "m", "/m:state");
        let d = oper_slot_path(&repo, "m", "/m:other");
        assert_ne!(a, b);
        assert_ne!(c, d);
    }

    #[test]
    fn test_dismiss_single_unblocks() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Repository::with_root(tmp.path()).unwrap();
        repo.ensure_dirs().unwrap();
        let path = oper_slot_path(&repo, "m", "/m:state");
        let mut slot = SubSlot::open(&path, false).unwrap();
        slot.lock(LockMode::Write, 1000).unwrap();
        slot.write_event(5, EventCode::Oper, Sid::default(), b"x").unwrap();
        slot.unlock(LockMode::Write);

        let mut other = SubSlot::open(&path, false).unwrap();
        dismiss_single(&mut other).unwrap();

        slot.lock(LockMode::Read, 1000).unwrap();
        assert_eq!(slot.event(), EventCode::Success);
        assert!(slot.payload().is_empty());
        slot.unlock(LockMode::Read);
    }

    #[test]
    fn test_dismiss_multi_last_flips() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Repository::with_root(tmp.path()).unwrap();
        repo.ensure_dirs().unwrap();
        let path = change_slot_path(&repo, "m", Datastore::Running);
        let mut slot = SubSlot::open(&path, true).unwrap();
        slot.lock(LockMode::Write, 1000).unwrap();
        slot.write_event_multi(1, 0, 2, EventCode::Change, Sid::default(), b"d")
            .unwrap();
        slot.unlock(LockMode::Write);

        dismiss_multi(&mut slot).unwrap();
        slot.lock(LockMode::Read, 1000).unwrap();
        assert_eq!(slot.event(), EventCode::Change);
        slot.unlock(LockMode::Read);

        dismiss_multi(&mut slot).unwrap();
        slot.lock(LockMode::Read, 1000).unwrap();
        assert_eq!(slot.event(), EventCode::Success);
        slot.unlock(LockMode::Read);
    }
}
