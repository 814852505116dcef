//! Ownership-aware, field-level patching of Kubernetes objects.
//!
//! This crate lets a declarative tool own a handful of fields on an object that is otherwise
//! managed by somebody else. Patches are driven through server-side apply, every field the
//! patch touches is attributed to a field manager, and the outcome is flattened into a stable
//! [`projection::Projection`] so that a plan and a later apply agree with each other.
//!
//! The entry point is [`engine::FieldPatcher`], which exposes the three phases of a binding's
//! lifecycle:
//!
//! - [`FieldPatcher::compute_projection`](engine::FieldPatcher::compute_projection) at plan time,
//! - [`FieldPatcher::apply_and_update_projection`](engine::FieldPatcher::apply_and_update_projection)
//!   at apply time and
//! - [`FieldPatcher::reconcile`](engine::FieldPatcher::reconcile) at read time, which detects and
//!   corrects drift.
//!
//! The object store itself is abstracted by [`store::ObjectStore`]. [`store::KubeStore`] talks to
//! a real API server.

pub mod conflict;
pub mod diagnostics;
pub mod drift;
pub mod engine;
pub mod managed_fields;
pub mod manager;
pub mod merge;
pub mod ownership;
pub mod patch;
pub mod path;
pub mod projection;
pub mod store;
pub mod target;

// External re-exports
pub use json_patch;
pub use k8s_openapi;
pub use kube;
