//! pybridge: streaming IPC bridge between host tasks and external Python
//! worker processes.
//!
//! A data-processing task offloads per-record computation to a long-lived
//! worker process: the bridge spawns and supervises the worker, announces a
//! private loopback socket through a stdin preamble, distributes broadcast
//! variables, then drives a half-duplex signal loop exchanging encoded
//! record buffers. Record serialization stays behind the [`transfer`] seams;
//! the bridge only ever sees byte lengths and remainder flags.

pub mod bridge;
pub mod config;
pub mod streamer;
pub mod supervisor;
pub mod transfer;

pub use bridge::protocol::InputSlot;
pub use config::{BridgeConfig, PythonVersion};
pub use streamer::{BridgeError, WorkerBridge};
pub use supervisor::{
    Diagnostics, PythonSpawner, SpawnError, WorkerLaunch, WorkerProcess, WorkerSpawner,
};
pub use transfer::{
    BroadcastSource, Collector, MetaRecord, RecordReceiver, RecordSender,
};
