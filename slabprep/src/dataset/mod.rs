//! Dataset discovery and run selection.

mod entities;
mod layout;
mod metadata;
mod run;
mod selector;

pub use entities::{split_extension, FileEntities};
pub use layout::{BidsDirectory, DatasetLayout};
pub use metadata::{PhaseEncodingDirection, RunMetadata};
pub use run::{
    sidecar_path, FieldmapEstimator, FieldmapSet, ModalityClass, Run, StructuralRun, NON_SLAB_TASKS,
    WHOLE_VOLUME_TASK,
};
pub use selector::{choose_whole_volume, order_by_acquisition, select_runs, Selection, SelectionFlags, SlabRun};
