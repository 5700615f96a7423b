//! Convoy core library
//!
//! Release orchestration over a path-addressed document store: releases of a
//! package become persisted runs that advance through an injected
//! [`package::FunctionRunner`], while a [`worker::Worker`] reconciles declared
//! Intent with converged State.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod package;
pub mod refs;
pub mod release;
pub mod run;
pub mod state;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use context::EngineContext;
pub use error::StoreError;
pub use refs::Ref;
pub use release::ReleaseTracker;
pub use status::Status;
pub use store::{RefAccess, RefStore};
pub use worker::Worker;
