//! Run-scoped arena of temporary artifacts.
//!
//! Every intermediate data unit is a file under the run's temp directory,
//! named `<prefix>-<name>`. The store hands out typed handles, tracks which
//! ones are live, deletes them eagerly on request and deletes whatever is
//! left at teardown (explicitly via [`ArtifactStore::release_all`] or on drop).
//!
//! Registration goes through concurrent maps so segment chains running in
//! parallel can allocate without further coordination.

use crate::error::{PipelineError, Result};
use crate::pipeline::Metrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Compile-time tag for the content of an artifact.
pub trait ArtifactKind: Send + Sync + 'static {
    const KIND: &'static str;
}

macro_rules! artifact_kinds {
    ($($(#[$doc:meta])* $name:ident => $kind:literal;)*) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy)]
            pub enum $name {}

            impl ArtifactKind for $name {
                const KIND: &'static str = $kind;
            }
        )*
    };
}

artifact_kinds! {
    /// Multichannel time series `[channels, samples]`
    Timeseries => "timeseries";
    /// Event sample indices `[1, events]`
    EventTimes => "event_times";
    /// Per-event amplitudes `[1, events]`
    Amplitudes => "amplitudes";
    /// Event clips
    Clips => "clips";
    /// Dataset-wide whitening matrix
    WhiteningMatrix => "whitening_matrix";
    /// One cluster label per clip
    Labels => "labels";
    /// Firing table `[fields, events]`
    Firings => "firings";
    /// Per-cluster quality metrics
    ClusterMetrics => "cluster_metrics";
}

/// Unique id of a store-owned artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactId(u64);

/// Untyped handle to an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    /// `None` for external artifacts the store does not own
    id: Option<ArtifactId>,
    name: Arc<str>,
    path: Arc<Path>,
}

impl ArtifactRef {
    /// Wrap a user-supplied path. Never registered, never deleted.
    pub fn external(path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = path.into();
        let name = path.display().to_string();
        Self {
            id: None,
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn id(&self) -> Option<ArtifactId> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_external(&self) -> bool {
        self.id.is_none()
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Handle to an artifact of kind `K`.
pub struct Artifact<K: ArtifactKind> {
    handle: ArtifactRef,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ArtifactKind> Artifact<K> {
    fn new(handle: ArtifactRef) -> Self {
        Self {
            handle,
            _kind: PhantomData,
        }
    }

    /// Wrap a user-supplied path as an artifact of this kind.
    pub fn external(path: impl Into<PathBuf>) -> Self {
        Self::new(ArtifactRef::external(path))
    }

    pub fn handle(&self) -> &ArtifactRef {
        &self.handle
    }

    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn kind(&self) -> &'static str {
        K::KIND
    }
}

impl<K: ArtifactKind> Clone for Artifact<K> {
    fn clone(&self) -> Self {
        Self::new(self.handle.clone())
    }
}

impl<K: ArtifactKind> PartialEq for Artifact<K> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl<K: ArtifactKind> fmt::Debug for Artifact<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("kind", &K::KIND)
            .field("name", &self.handle.name())
            .field("path", &self.handle.path())
            .finish()
    }
}

/// Temporary artifact arena scoped to one run.
pub struct ArtifactStore {
    /// Directory holding every temporary
    dir: PathBuf,

    /// Filename prefix distinguishing concurrent runs sharing a directory
    prefix: String,

    next_id: AtomicU64,

    /// Live handles by id
    live: DashMap<ArtifactId, ArtifactRef>,

    /// Live names, to reject duplicates
    names: DashMap<Arc<str>, ArtifactId>,

    metrics: Option<Arc<Metrics>>,
}

impl ArtifactStore {
    /// Open a store, creating the temp directory if needed.
    pub fn open(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| PipelineError::resource(&dir, e))?;

        tracing::debug!("Artifact store opened at {}", dir.display());

        Ok(Self {
            dir,
            prefix: prefix.into(),
            next_id: AtomicU64::new(0),
            live: DashMap::new(),
            names: DashMap::new(),
            metrics,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate a fresh handle. The file itself is created by whichever step
    /// writes the artifact.
    pub fn allocate<K: ArtifactKind>(&self, name: &str) -> Result<Artifact<K>> {
        if name.is_empty() || name.contains(std::path::is_separator) {
            return Err(PipelineError::artifact(format!("invalid artifact name '{}'", name)));
        }

        let name: Arc<str> = name.into();
        let id = ArtifactId(self.next_id.fetch_add(1, Ordering::Relaxed));

        match self.names.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(PipelineError::artifact(format!(
                    "artifact '{}' is already live",
                    name
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let path = self.dir.join(format!("{}-{}", self.prefix, name));
        let handle = ArtifactRef {
            id: Some(id),
            name,
            path: path.into(),
        };
        self.live.insert(id, handle.clone());

        if let Some(ref m) = self.metrics {
            m.add_artifact_allocated();
        }

        Ok(Artifact::new(handle))
    }

    /// Release one artifact: forget the handle and delete its file.
    ///
    /// Returns `false` for external artifacts and for handles that were
    /// already released.
    pub fn release(&self, handle: &ArtifactRef) -> Result<bool> {
        let Some(id) = handle.id() else {
            return Ok(false);
        };
        let Some((_, handle)) = self.live.remove(&id) else {
            return Ok(false);
        };
        self.names.remove(&handle.name);

        if let Some(ref m) = self.metrics {
            m.add_artifact_released();
        }

        match std::fs::remove_file(handle.path()) {
            Ok(()) => {
                tracing::trace!("Released artifact {}", handle);
                Ok(true)
            }
            // Never written (e.g. the producing step did not run)
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(PipelineError::resource(handle.path(), e)),
        }
    }

    /// Release every live artifact, continuing past individual failures.
    ///
    /// Every handle leaves the registry; files that could not be removed are
    /// counted as `failed`, not `released`.
    pub fn release_all(&self) -> ReleaseSummary {
        let mut handles: Vec<ArtifactRef> = self.live.iter().map(|e| e.value().clone()).collect();
        handles.sort_by_key(|h| h.id());

        let mut summary = ReleaseSummary::default();
        for handle in handles {
            match self.release(&handle) {
                Ok(true) => summary.released += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Failed to remove temporary {}: {}", handle, e);
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    pub fn is_live(&self, handle: &ArtifactRef) -> bool {
        handle.id().is_some_and(|id| self.live.contains_key(&id))
    }

    /// Number of live handles.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

/// Result of [`ArtifactStore::release_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub released: usize,
    pub failed: usize,
}

impl std::fmt::Display for ReleaseSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} released", self.released)?;
        if self.failed > 0 {
            write!(f, ", {} could not be removed", self.failed)?;
        }
        Ok(())
    }
}

impl Drop for ArtifactStore {
    fn drop(&mut self) {
        if !self.live.is_empty() {
            let summary = self.release_all();
            tracing::debug!("Leftover artifacts on drop: {}", summary);
        }
    }
}
