//! Structural patch engine
//!
//! Turns an assistant-proposed snippet into a single validated edit against
//! an indentation-delimited strategy file:
//!
//! 1. [`locate`] resolves where the snippet lands (selection, enclosing
//!    function, function by name, or hyperopt parameter).
//! 2. [`normalize`] re-indents the snippet for that spot.
//! 3. [`mismatch`] warns when the snippet names a different function.
//! 4. [`edit`] builds the typed [`Edit`] with the exact `before` text.
//! 5. [`apply`] is what a validator runs to land edits without clobbering
//!    newer text.

pub mod apply;
pub mod edit;
pub mod locate;
pub mod markers;
pub mod mismatch;
pub mod normalize;

pub use apply::{apply_edits, locate_function, ApplyError, AppliedEdit};
pub use edit::{build_patch, Edit, InsertAnchor, PatchPlan, PatchTarget, ReplaceTarget};
pub use locate::{
    locate_enclosing, locate_named, locate_param, locate_selection, LocateError, Region,
};
pub use mismatch::{context_name, detect_mismatch, extract_def_name};
pub use normalize::{dedent, reindent, target_prefix};
