pub mod consumer;
pub mod metrics;
pub mod poller;
pub mod server;
pub mod snapshot;
pub mod supervisor;

pub use consumer::Consumer;
pub use metrics::{Metrics, PausedPair, StatusReport};
pub use poller::{PollOutcome, Poller};
pub use snapshot::SnapshotStore;
pub use supervisor::{Engine, EngineSettings, PairHealth};
