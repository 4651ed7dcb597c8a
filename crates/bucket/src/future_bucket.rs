//! FutureBucket - a resumable handle to a background bucket merge.
//!
//! # State Machine
//!
//! ```text
//!            start_merge                 resolve
//!   Clear ───────────────▶ LiveInputs ───────────▶ LiveOutput
//!                              │  ▲                    │
//!                  to_snapshot │  │ make_live          │ to_snapshot
//!                              ▼  │                    ▼
//!                          HashInputs              HashOutput ──make_live──▶ LiveOutput
//! ```
//!
//! - `Clear`: no inputs, no output
//! - `LiveInputs`: live input buckets, merge running in the background
//! - `LiveOutput`: live output bucket
//! - `HashInputs` / `HashOutput`: hashes only, as restored from persistence
//!
//! Every transition re-checks the field combination expected for the new
//! state, and that any cached hash agrees with the live bucket it names.
//!
//! # Threading
//!
//! A `FutureBucket` lives on the control thread. The merge body runs via
//! [`BackgroundScheduler`] and hands its result back through a
//! `tokio::sync::oneshot` channel, polled with `try_recv` by
//! [`FutureBucket::merge_complete`] and awaited by [`FutureBucket::resolve`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::oneshot;

use henyey_common::Hash256;

use crate::bucket::Bucket;
use crate::manager::{BackgroundScheduler, BucketRegistry, BucketServices};
use crate::{BucketError, Result};

/// State of a FutureBucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FutureBucketState {
    /// No inputs; no outputs; no hashes.
    Clear,
    /// Output hash present; no live output bucket.
    HashOutput,
    /// Input hashes present; no live input buckets.
    HashInputs,
    /// Live output bucket available.
    LiveOutput,
    /// Live input buckets; merge in progress.
    LiveInputs,
}

/// Serializable form of a FutureBucket.
///
/// Live states are written as their hash-only counterparts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FutureBucketSnapshot {
    pub state: FutureBucketState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shadows: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl Default for FutureBucketSnapshot {
    fn default() -> Self {
        Self {
            state: FutureBucketState::Clear,
            curr: None,
            snap: None,
            shadows: Vec::new(),
            output: None,
        }
    }
}

/// Parameters of a merge launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSettings {
    /// Ceiling on the merged protocol version.
    pub max_protocol_version: u32,
    /// Whether DEAD entries survive into the output.
    pub keep_dead_entries: bool,
    /// Whether the merge reports its counters.
    pub count_merge_events: bool,
}

type MergeResult = Result<Arc<Bucket>>;

/// A bucket merge that may still be running.
pub struct FutureBucket {
    state: FutureBucketState,

    input_curr: Option<Arc<Bucket>>,
    input_snap: Option<Arc<Bucket>>,
    input_shadows: Vec<Arc<Bucket>>,
    output: Option<Arc<Bucket>>,

    /// Result channel of the running merge.
    receiver: Option<oneshot::Receiver<MergeResult>>,
    /// Result taken off the channel by `merge_complete` but not yet resolved.
    completed: Option<MergeResult>,

    input_curr_hash: Option<Hash256>,
    input_snap_hash: Option<Hash256>,
    input_shadow_hashes: Vec<Hash256>,
    output_hash: Option<Hash256>,
}

impl FutureBucket {
    /// Create a FutureBucket in the `Clear` state.
    pub fn clear() -> Self {
        Self {
            state: FutureBucketState::Clear,
            input_curr: None,
            input_snap: None,
            input_shadows: Vec::new(),
            output: None,
            receiver: None,
            completed: None,
            input_curr_hash: None,
            input_snap_hash: None,
            input_shadow_hashes: Vec::new(),
            output_hash: None,
        }
    }

    /// Record the inputs and launch their merge in the background.
    pub fn start_merge(
        services: &Arc<dyn BucketServices>,
        curr: Arc<Bucket>,
        snap: Arc<Bucket>,
        shadows: Vec<Arc<Bucket>>,
        settings: MergeSettings,
    ) -> Result<Self> {
        let mut fb = Self::clear();
        fb.input_curr_hash = Some(curr.hash());
        fb.input_snap_hash = Some(snap.hash());
        fb.input_shadow_hashes = shadows.iter().map(|b| b.hash()).collect();
        fb.input_curr = Some(curr);
        fb.input_snap = Some(snap);
        fb.input_shadows = shadows;
        fb.state = FutureBucketState::LiveInputs;
        fb.launch(services, settings)?;
        Ok(fb)
    }

    /// A FutureBucket whose merge is already done.
    pub fn from_output(bucket: Arc<Bucket>) -> Self {
        let mut fb = Self::clear();
        fb.output_hash = Some(bucket.hash());
        fb.output = Some(bucket);
        fb.state = FutureBucketState::LiveOutput;
        fb
    }

    /// Rebuild a FutureBucket from its persisted form.
    ///
    /// Only `Clear` and the hash states are accepted.
    pub fn from_snapshot(snapshot: &FutureBucketSnapshot) -> Result<Self> {
        let mut fb = Self::clear();
        match snapshot.state {
            FutureBucketState::Clear => {}
            FutureBucketState::HashOutput => {
                fb.output_hash = Some(parse_hash("output", snapshot.output.as_deref())?);
                fb.state = FutureBucketState::HashOutput;
            }
            FutureBucketState::HashInputs => {
                fb.input_curr_hash = Some(parse_hash("curr", snapshot.curr.as_deref())?);
                fb.input_snap_hash = Some(parse_hash("snap", snapshot.snap.as_deref())?);
                fb.input_shadow_hashes = snapshot
                    .shadows
                    .iter()
                    .map(|h| parse_hash("shadow", Some(h)))
                    .collect::<Result<_>>()?;
                fb.state = FutureBucketState::HashInputs;
            }
            other => {
                return Err(BucketError::Serialization(format!(
                    "invalid deserialized state: {:?}",
                    other
                )))
            }
        }
        fb.check_state()?;
        Ok(fb)
    }

    /// The persisted form of this FutureBucket.
    pub fn to_snapshot(&self) -> FutureBucketSnapshot {
        match self.state {
            FutureBucketState::Clear => FutureBucketSnapshot::default(),
            FutureBucketState::HashOutput | FutureBucketState::LiveOutput => FutureBucketSnapshot {
                state: FutureBucketState::HashOutput,
                output: self.output_hash.map(|h| h.to_hex()),
                ..Default::default()
            },
            FutureBucketState::HashInputs | FutureBucketState::LiveInputs => FutureBucketSnapshot {
                state: FutureBucketState::HashInputs,
                curr: self.input_curr_hash.map(|h| h.to_hex()),
                snap: self.input_snap_hash.map(|h| h.to_hex()),
                shadows: self.input_shadow_hashes.iter().map(|h| h.to_hex()).collect(),
                output: None,
            },
        }
    }

    pub fn state(&self) -> FutureBucketState {
        self.state
    }

    pub fn is_clear(&self) -> bool {
        self.state == FutureBucketState::Clear
    }

    /// Whether this FutureBucket holds live bucket references.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            FutureBucketState::LiveInputs | FutureBucketState::LiveOutput
        )
    }

    pub fn is_merging(&self) -> bool {
        self.state == FutureBucketState::LiveInputs
    }

    /// Whether this FutureBucket holds only hashes.
    pub fn has_hashes(&self) -> bool {
        matches!(
            self.state,
            FutureBucketState::HashInputs | FutureBucketState::HashOutput
        )
    }

    pub fn has_output_hash(&self) -> bool {
        self.output_hash.is_some()
    }

    pub fn output_hash(&self) -> Option<Hash256> {
        self.output_hash
    }

    pub fn output(&self) -> Option<&Arc<Bucket>> {
        self.output.as_ref()
    }

    pub fn input_curr_hash(&self) -> Option<Hash256> {
        self.input_curr_hash
    }

    pub fn input_snap_hash(&self) -> Option<Hash256> {
        self.input_snap_hash
    }

    pub fn input_shadow_hashes(&self) -> &[Hash256] {
        &self.input_shadow_hashes
    }

    /// Every bucket hash this FutureBucket refers to.
    pub fn hashes(&self) -> Vec<Hash256> {
        self.input_curr_hash
            .iter()
            .chain(self.input_snap_hash.iter())
            .chain(self.input_shadow_hashes.iter())
            .chain(self.output_hash.iter())
            .copied()
            .collect()
    }

    /// Non-blocking check whether the merge has produced its result.
    pub fn merge_complete(&mut self) -> bool {
        match self.state {
            FutureBucketState::LiveOutput => true,
            FutureBucketState::LiveInputs => {
                if self.completed.is_some() {
                    return true;
                }
                let Some(receiver) = self.receiver.as_mut() else {
                    return false;
                };
                match receiver.try_recv() {
                    Ok(result) => {
                        self.receiver = None;
                        self.completed = Some(result);
                        true
                    }
                    Err(oneshot::error::TryRecvError::Empty) => false,
                    Err(oneshot::error::TryRecvError::Closed) => {
                        self.receiver = None;
                        self.completed = Some(Err(dropped_task_error()));
                        true
                    }
                }
            }
            _ => false,
        }
    }

    /// Wait for the merge and move to `LiveOutput`.
    ///
    /// Blocks the calling thread if the merge is still running. Inside a
    /// multi-threaded Tokio runtime the wait is wrapped in `block_in_place`;
    /// a current-thread runtime cannot block and gets an `InvalidState` error.
    pub fn resolve(&mut self) -> Result<Arc<Bucket>> {
        self.check_state()?;
        match self.state {
            FutureBucketState::LiveOutput => self.output.clone().ok_or_else(|| {
                BucketError::InvalidState("live output without a bucket".to_string())
            }),
            FutureBucketState::LiveInputs => {
                let result = match self.completed.take() {
                    Some(result) => result,
                    None => {
                        let receiver = self.receiver.take().ok_or_else(|| {
                            BucketError::Merge("merge result already consumed".to_string())
                        })?;
                        self.wait_for(receiver)?
                    }
                };
                let bucket = match result {
                    Ok(bucket) => bucket,
                    Err(e) => {
                        // Keep the failure so later resolves report it again.
                        self.completed = Some(Err(e.clone()));
                        return Err(e);
                    }
                };
                self.set_live_output(Arc::clone(&bucket));
                self.check_state()?;
                Ok(bucket)
            }
            other => Err(BucketError::InvalidState(format!(
                "cannot resolve future bucket in state {:?}",
                other
            ))),
        }
    }

    /// Turn a hash-only FutureBucket back into a live one.
    ///
    /// An output hash is resolved directly. Input hashes are resolved and
    /// their merge is started again; the result is byte-identical to the
    /// merge that was interrupted.
    pub fn make_live(
        &mut self,
        services: &Arc<dyn BucketServices>,
        settings: MergeSettings,
    ) -> Result<()> {
        self.check_state()?;
        if !self.has_hashes() {
            return Err(BucketError::InvalidState(format!(
                "cannot make live in state {:?}",
                self.state
            )));
        }

        if let Some(hash) = self.output_hash {
            let bucket = load(services.as_ref(), &hash)?;
            self.set_live_output(bucket);
            return self.check_state();
        }

        let curr_hash = self.input_curr_hash.ok_or_else(|| missing("curr"))?;
        let snap_hash = self.input_snap_hash.ok_or_else(|| missing("snap"))?;
        let curr = load(services.as_ref(), &curr_hash)?;
        let snap = load(services.as_ref(), &snap_hash)?;
        let shadows = self
            .input_shadow_hashes
            .iter()
            .map(|h| load(services.as_ref(), h))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            curr = %curr_hash,
            snap = %snap_hash,
            shadows = shadows.len(),
            "restarting merge from persisted hashes"
        );

        self.input_curr = Some(curr);
        self.input_snap = Some(snap);
        self.input_shadows = shadows;
        self.state = FutureBucketState::LiveInputs;
        self.launch(services, settings)
    }

    fn launch(&mut self, services: &Arc<dyn BucketServices>, settings: MergeSettings) -> Result<()> {
        let (Some(curr), Some(snap)) = (self.input_curr.clone(), self.input_snap.clone()) else {
            return Err(BucketError::InvalidState(
                "merge launched without live inputs".to_string(),
            ));
        };
        let shadows = self.input_shadows.clone();
        let task_services = Arc::clone(services);
        let (sender, receiver) = oneshot::channel();

        self.receiver = Some(receiver);
        self.completed = None;
        self.check_state()?;

        tracing::debug!(
            curr = %curr.hash(),
            snap = %snap.hash(),
            shadows = shadows.len(),
            max_protocol_version = settings.max_protocol_version,
            keep_dead_entries = settings.keep_dead_entries,
            "scheduling bucket merge"
        );

        let task = move || {
            let result = Bucket::merge(
                &*task_services,
                settings.max_protocol_version,
                &curr,
                &snap,
                &shadows,
                settings.keep_dead_entries,
                settings.count_merge_events,
            )
            .map_err(|e| {
                tracing::error!(
                    curr = %curr.hash(),
                    snap = %snap.hash(),
                    error = %e,
                    "background merge failed"
                );
                BucketError::MergeFailed {
                    curr: curr.hash(),
                    snap: snap.hash(),
                    source: Box::new(e),
                }
            });
            let _ = sender.send(result);
        };
        services.post_on_background_thread(Box::new(task), "bucket-merge");
        Ok(())
    }

    fn wait_for(&self, mut receiver: oneshot::Receiver<MergeResult>) -> Result<MergeResult> {
        match receiver.try_recv() {
            Ok(result) => return Ok(result),
            Err(oneshot::error::TryRecvError::Closed) => return Ok(Err(dropped_task_error())),
            Err(oneshot::error::TryRecvError::Empty) => {}
        }

        tracing::info!(
            curr = ?self.input_curr_hash,
            snap = ?self.input_snap_hash,
            "waiting for running merge"
        );
        let received = match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                return Err(BucketError::InvalidState(
                    "cannot block on a merge from a current-thread runtime".to_string(),
                ))
            }
            Ok(_) => tokio::task::block_in_place(move || receiver.blocking_recv()),
            Err(_) => receiver.blocking_recv(),
        };
        Ok(received.unwrap_or_else(|_| Err(dropped_task_error())))
    }

    fn set_live_output(&mut self, bucket: Arc<Bucket>) {
        self.input_curr = None;
        self.input_snap = None;
        self.input_shadows.clear();
        self.input_curr_hash = None;
        self.input_snap_hash = None;
        self.input_shadow_hashes.clear();
        self.receiver = None;
        self.completed = None;
        self.output_hash = Some(bucket.hash());
        self.output = Some(bucket);
        self.state = FutureBucketState::LiveOutput;
    }

    fn check_state(&self) -> Result<()> {
        let has_live_inputs =
            self.input_curr.is_some() || self.input_snap.is_some() || !self.input_shadows.is_empty();
        let has_input_hashes = self.input_curr_hash.is_some()
            || self.input_snap_hash.is_some()
            || !self.input_shadow_hashes.is_empty();
        let has_task = self.receiver.is_some() || self.completed.is_some();

        let ok = match self.state {
            FutureBucketState::Clear => {
                !has_live_inputs
                    && !has_input_hashes
                    && !has_task
                    && self.output.is_none()
                    && self.output_hash.is_none()
            }
            FutureBucketState::LiveInputs => {
                self.input_curr.is_some()
                    && self.input_snap.is_some()
                    && self.output.is_none()
                    && self.output_hash.is_none()
            }
            FutureBucketState::LiveOutput => {
                !has_live_inputs && !has_task && self.output.is_some() && self.output_hash.is_some()
            }
            FutureBucketState::HashInputs => {
                !has_live_inputs
                    && !has_task
                    && self.input_curr_hash.is_some()
                    && self.input_snap_hash.is_some()
                    && self.output.is_none()
                    && self.output_hash.is_none()
            }
            FutureBucketState::HashOutput => {
                !has_live_inputs
                    && !has_input_hashes
                    && !has_task
                    && self.output.is_none()
                    && self.output_hash.is_some()
            }
        };
        if !ok {
            return Err(BucketError::InvalidState(format!(
                "future bucket fields inconsistent with state {:?}",
                self.state
            )));
        }
        self.check_hashes_match()
    }

    fn check_hashes_match(&self) -> Result<()> {
        let expect_hash = |what: &str, expected: Option<Hash256>, actual: Hash256| {
            if expected == Some(actual) {
                Ok(())
            } else {
                Err(BucketError::InvalidState(format!(
                    "{} hash {:?} does not match live bucket {}",
                    what, expected, actual
                )))
            }
        };

        if let Some(curr) = &self.input_curr {
            expect_hash("curr", self.input_curr_hash, curr.hash())?;
        }
        if let Some(snap) = &self.input_snap {
            expect_hash("snap", self.input_snap_hash, snap.hash())?;
        }
        if !self.input_shadows.is_empty() {
            if self.input_shadows.len() != self.input_shadow_hashes.len() {
                return Err(BucketError::InvalidState(format!(
                    "{} live shadows but {} shadow hashes",
                    self.input_shadows.len(),
                    self.input_shadow_hashes.len()
                )));
            }
            for (bucket, hash) in self.input_shadows.iter().zip(&self.input_shadow_hashes) {
                expect_hash("shadow", Some(*hash), bucket.hash())?;
            }
        }
        if let Some(output) = &self.output {
            expect_hash("output", self.output_hash, output.hash())?;
        }
        Ok(())
    }
}

impl Default for FutureBucket {
    fn default() -> Self {
        Self::clear()
    }
}

impl std::fmt::Debug for FutureBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureBucket")
            .field("state", &self.state)
            .field("input_curr_hash", &self.input_curr_hash)
            .field("input_snap_hash", &self.input_snap_hash)
            .field("input_shadows", &self.input_shadow_hashes.len())
            .field("output_hash", &self.output_hash)
            .finish()
    }
}

fn parse_hash(field: &str, value: Option<&str>) -> Result<Hash256> {
    let value = value.ok_or_else(|| BucketError::Serialization(format!("missing {} hash", field)))?;
    Hash256::from_hex(value)
        .map_err(|e| BucketError::Serialization(format!("invalid {} hash: {}", field, e)))
}

fn load(services: &dyn BucketServices, hash: &Hash256) -> Result<Arc<Bucket>> {
    services
        .get_bucket_by_hash(hash)?
        .ok_or_else(|| BucketError::NotFound(hash.to_hex()))
}

fn missing(field: &str) -> BucketError {
    BucketError::InvalidState(format!("missing {} hash", field))
}

fn dropped_task_error() -> BucketError {
    BucketError::Merge("merge task dropped without a result".to_string())
}
