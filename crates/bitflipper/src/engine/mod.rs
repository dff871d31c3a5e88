pub mod exchange;
pub mod port;
pub mod rate_gate;
pub mod scheduler;
pub mod session;
pub mod worker;
