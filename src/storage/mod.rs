//! External persistence collaborators.
//!
//! `blob` is the object-store contract (plus HTTP and filesystem
//! implementations) and the object-key layout; `db` is the relational
//! index of texts and their audio artifacts — the durable source of truth
//! for success statistics.

pub mod blob;
pub mod db;

pub use blob::{audio_filename, audio_object_key, FsObjectStore, HttpObjectStore, ObjectStore};
pub use db::{AudioRow, TaskIndex, TextRow};
