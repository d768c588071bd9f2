#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use rt_engine as engine;
pub use rt_sync as sync;

pub use rt_engine::{
    Context, ContextId, EngineId, Handle, HardAffinity, IoMode, Job, ProfileReport, RawFd,
    Result, Runtime, RuntimeConfig, RuntimeError, SizeClass, Spark, SyncTerm, init_runtime,
    pin_primordial_thread,
};
