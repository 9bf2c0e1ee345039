//! Sessions: datastore selection, pending edits, apply/discard, reads,
//! datastore locks and operation invocation.

use crate::connection::{ConnInner, Connection};
use std::collections::HashMap;
use std::sync::Arc;
use yds_common::{Datastore, GetOperOptions, Sid, YdsError, YdsResult};
use yds_data::diff::DiffTree;
use yds_data::edit::{Edit, EditOp};
use yds_data::path::Path;
use yds_data::tree::{DataForest, DataNode};
use yds_engine::Engine;
use yds_sub::notif_log;

/// Default timeout for operations that wait on subscribers.
pub const DEFAULT_OPER_TIMEOUT_MS: u32 = 5000;

/// A session bound to one connection.
pub struct Session {
    pub(crate) conn: Arc<ConnInner>,
    sid: Sid,
    ds: Datastore,
    edits: HashMap<Datastore, Edit>,
    last_diff: Option<DiffTree>,
    last_error: Option<String>,
}

impl Session {
    /// Start a session on `ds`.
    pub fn start(conn: &Connection, ds: Datastore) -> Session {
        let sid = {
            let shm = conn.inner.shm.lock();
            Sid {
                id: shm.new_sid(),
                nc_id: 0,
            }
        };
        Session {
            conn: Arc::clone(&conn.inner),
            sid,
            ds,
            edits: HashMap::new(),
            last_diff: None,
            last_error: None,
        }
    }

    /// Session ID.
    pub fn sid(&self) -> Sid {
        self.sid
    }

    /// Currently selected datastore.
    pub fn datastore(&self) -> Datastore {
        self.ds
    }

    /// Switch the session to another datastore. Pending edits stay bound
    /// to the datastore they were made in.
    pub fn switch_datastore(&mut self, ds: Datastore) {
        self.ds = ds;
    }

    /// Forward diff produced by the last successful apply.
    pub fn last_diff(&self) -> Option<&DiffTree> {
        self.last_diff.as_ref()
    }

    /// Message of the last failed apply, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn with_engine<T>(&self, f: impl FnOnce(&mut Engine<'_>) -> YdsResult<T>) -> YdsResult<T> {
        let mut shm = self.conn.shm.lock();
        let mut engine = Engine {
            shm: &mut shm,
            repo: &self.conn.repo,
            manifest: &self.conn.manifest,
            cache: self.conn.cache.as_ref(),
            cid: self.conn.cid,
            sid: self.sid,
        };
        f(&mut engine)
    }

    /// Record a merge (create-or-set) change at `path`.
    pub fn set_item(&mut self, path: &str, value: Option<&str>) -> YdsResult<()> {
        self.edit_item(path, value, EditOp::Merge)
    }

    /// Record a tolerant delete at `path`.
    pub fn delete_item(&mut self, path: &str) -> YdsResult<()> {
        self.edit_item(path, None, EditOp::Remove)
    }

    /// Record a change with an explicit operation.
    pub fn edit_item(&mut self, path: &str, value: Option<&str>, op: EditOp) -> YdsResult<()> {
        let parsed = Path::parse(path)?;
        self.edits
            .entry(self.ds)
            .or_default()
            .add(&parsed, value, op)
    }

    /// Whether the current datastore has pending changes.
    pub fn has_changes(&self) -> bool {
        self.edits.get(&self.ds).is_some_and(|e| !e.is_empty())
    }

    /// Apply the pending edit of the current datastore.
    pub fn apply_changes(&mut self, timeout_ms: u32) -> YdsResult<()> {
        let Some(edit) = self.edits.remove(&self.ds) else {
            return Ok(());
        };
        if edit.is_empty() {
            return Ok(());
        }
        let ds = self.ds;
        match self.with_engine(|e| e.apply_changes(ds, &edit, timeout_ms)) {
            Ok(diff) => {
                self.last_diff = Some(diff);
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                // The edit stays pending so the caller may fix and retry.
                self.edits.insert(self.ds, edit);
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Drop the pending edit of the current datastore.
    pub fn discard_changes(&mut self) {
        self.edits.remove(&self.ds);
    }

    /// Read data selected by `xpath` from the current datastore.
    pub fn get_data(&self, xpath: &str) -> YdsResult<DataForest> {
        self.get_data_opts(xpath, GetOperOptions::empty(), DEFAULT_OPER_TIMEOUT_MS)
    }

    /// Read data with operational options and an explicit timeout.
    pub fn get_data_opts(
        &self,
        xpath: &str,
        oper_opts: GetOperOptions,
        timeout_ms: u32,
    ) -> YdsResult<DataForest> {
        let filter = Path::parse(xpath)?;
        let ds = self.ds;
        self.with_engine(|e| e.get_data(ds, &filter, oper_opts, timeout_ms))
    }

    /// Read the single node selected by `xpath`.
    pub fn get_item(&self, xpath: &str) -> YdsResult<DataNode> {
        let filter = Path::parse(xpath)?;
        let forest = self.get_data(xpath)?;
        forest
            .find_one(&filter)
            .cloned()
            .ok_or_else(|| YdsError::NotFound {
                msg: format!("No data at \"{}\".", xpath),
            })
    }

    /// Take the datastore lock on one module, or all when `None`.
    pub fn lock(&self, module: Option<&str>) -> YdsResult<()> {
        let ds = self.ds;
        self.with_engine(|e| e.lock_ds(module, ds))
    }

    /// Release the datastore lock.
    pub fn unlock(&self, module: Option<&str>) -> YdsResult<()> {
        let ds = self.ds;
        self.with_engine(|e| e.unlock_ds(module, ds))
    }

    /// Replace the current datastore's content with another datastore's,
    /// for the given modules (all when `None`).
    pub fn copy_config(
        &mut self,
        from: Datastore,
        modules: Option<&[String]>,
        timeout_ms: u32,
    ) -> YdsResult<()> {
        let to = self.ds;
        if from == to {
            return Err(YdsError::InvalArg {
                msg: "Source and target datastore are the same.".to_string(),
            });
        }
        let diff = self.with_engine(|e| e.copy_config(from, to, modules, timeout_ms))?;
        self.last_diff = Some(diff);
        Ok(())
    }

    /// Reset the candidate datastore to mirror running.
    pub fn reset_candidate(&mut self) -> YdsResult<()> {
        self.edits.remove(&Datastore::Candidate);
        self.with_engine(|e| e.candidate_reset(None))
    }

    /// Send an RPC/action and wait for its output.
    pub fn rpc_send(
        &self,
        module: &str,
        input: &DataNode,
        timeout_ms: u32,
    ) -> YdsResult<DataNode> {
        self.with_engine(|e| e.send_rpc(module, input, timeout_ms))
    }

    /// Deliver a notification, stamping it with the current time.
    pub fn notif_send(&self, module: &str, notif: &DataNode) -> YdsResult<()> {
        let ts = notif_log::now_ts();
        self.with_engine(|e| e.send_notif(module, notif, ts))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Release any datastore locks this session still owns.
        for ds in Datastore::ALL {
            let res = self.with_engine(|e| e.unlock_ds(None, ds));
            if let Err(e) = res {
                tracing::debug!("Session {} unlock on close failed: {}.", self.sid.id, e);
            }
        }
    }
}
