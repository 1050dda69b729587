//! WASM module backend powered by Extism.
//!
//! A package ships a WASM unit for symbol `S` at `modules/S.wasm`, optionally
//! pinned by a blake3 hex digest in `modules/S.wasm.blake3`. Each call to
//! [`ModuleUnit::instantiate`](crate::backend::ModuleUnit::instantiate)
//! compiles a fresh Extism instance wrapped in a [`WasmExtension`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌────────────────┐     ┌──────────────┐
//! │ WasmModuleBackend │────▶│ WasmUnit       │────▶│ WasmExtension│
//! │ (ModuleBackend)   │     │ (bytes, limits)│     │ extism::Plugin│
//! └──────────────────┘     └────────────────┘     └──────────────┘
//!                                                       │
//!                                                       ▼
//!                                          initialize / activate /
//!                                          deactivate / dispose exports
//! ```
//!
//! Guests run without WASI, so a WASM plugin has no ambient filesystem,
//! network or process access at all.

pub mod loader;
pub mod plugin;

pub use loader::WasmModuleBackend;
pub use plugin::WasmExtension;
