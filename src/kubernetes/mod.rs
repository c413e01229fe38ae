//! Cluster observation: the dynamic watcher and the drift reconciler.

mod reconciler;
mod translate;
mod watcher;

pub use self::{
    reconciler::{Reconciler, ReconcilerConfig},
    translate::{TimestampSequencer, translate_object},
    watcher::KubeWatcher,
};
