//! Terminal output with plain fallback for CI and batch jobs
//!
//! ```rust,ignore
//! use byoe::ui::{self, UiContext, TaskSpinner};
//!
//! let ctx = UiContext::detect();
//! ui::intro(&ctx, "byoe update");
//!
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("Building snapshot...");
//! spinner.stop("Snapshot 20260301000000 published");
//!
//! ui::step_error_detail(&ctx, "hdf5@1.14.3", "see logs/20260301000000/hdf5-1a2b3c4d.log");
//! ```

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{
    intro, key_value, key_value_status, outro_error, outro_success, outro_warn, remark, section,
    step_error, step_error_detail, step_info, step_ok, step_ok_detail, step_warn,
};
pub use progress::TaskSpinner;
