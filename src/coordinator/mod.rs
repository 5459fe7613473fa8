// C4: two-phase commit coordinator.

mod coordinator;
mod messages;
mod transport;

pub use coordinator::TwoPhaseCommitCoordinator;
#[cfg(test)]
pub use coordinator::InjectedFault;
pub use coordinator::TwoPhaseCommitStats;
pub use messages::ArbiterMessage;
pub use transport::ArbiterTransport;
