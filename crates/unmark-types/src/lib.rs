//! Shared data model for unmark.
//!
//! Everything that crosses a crate or process boundary lives here: the
//! resolved [`ParamSet`], the persisted [`TaskStatus`] record and the partial
//! [`TaskUpdate`] merged into it.

pub mod params;
pub mod task;

pub use params::{ParamDefaults, ParamOverrides, ParamSet, resolve};
pub use task::{Stage, TaskState, TaskStatus, TaskSummary, TaskUpdate, VideoInfo};
