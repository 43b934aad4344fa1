//! # Flowrun: Experiment DAG Orchestration
//!
//! **Version**: 0.3.14
//!
//! Flowrun runs experiments: DAGs of flow nodes (a flow applied line by line
//! to a dataset) and command nodes (a shell command), with a lifecycle of
//! their own. Flow lines execute in isolated workers, outbound tool calls can
//! be recorded once and replayed byte for byte, and every step emits spans
//! that survive the hop from worker process back to the orchestrator.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Jidoka**: A crashing or hanging line stops its own worker, never the batch
//! - **Poka-Yoke safety**: Graphs are validated before anything runs
//! - **Genchi Genbutsu**: Recorded calls replay exactly what was observed
//! - **Heijunka**: Bounded task queue and bounded node parallelism
//!
//! ## Components
//!
//! ```text
//! ExperimentController ──► DagScheduler ──► WorkerPool ──► Worker (process | task)
//!                                 │                            │
//!                                 └── CommandRunner            ├──► CallRecorder
//!                                                              └──► TraceCollector
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowrun::context::EngineContext;
//! use flowrun::controller::{ControllerConfig, ExperimentController};
//! use flowrun::experiment::{CommandNode, Experiment};
//! use flowrun::pool::{PoolConfig, WorkerPool};
//! use flowrun::scheduler::SchedulerConfig;
//!
//! # async fn demo() -> flowrun::Result<()> {
//! let context = EngineContext::builder().build()?;
//! let pool = WorkerPool::new(
//!     PoolConfig::default(),
//!     Arc::new(context.process_launcher("target/debug/flowrun-worker")),
//! );
//! let controller = ExperimentController::new(
//!     ControllerConfig::builder().output_root("runs").build(),
//!     context.scheduler(SchedulerConfig::default(), pool),
//! )?;
//!
//! controller
//!     .create_or_update(Experiment::builder("hello").node(CommandNode::new("greet", "echo hi")).build())
//!     .await?;
//! controller.start("hello").await?;
//! let finished = controller.wait("hello").await?;
//! println!("{:?}", finished.last_run_status());
//! context.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod context;
pub mod controller;
pub mod error;
pub mod experiment;
pub mod graph;
pub mod pool;
pub mod recorder;
pub mod scheduler;
pub mod trace;

pub use error::{Error, ErrorKind, Result};
