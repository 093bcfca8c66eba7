pub mod docker;
pub mod lifecycle;
pub mod locks;
pub mod orchestrator;
pub mod poller;
pub mod probe;
pub mod snapshot;
