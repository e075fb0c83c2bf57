#![doc = "Fixed-period execution loop for robot and control programs."]

pub mod alarm;
pub mod program;
pub mod realtime;
pub mod sampler;
pub mod scheduler;
pub mod sim;
pub mod sink;
pub mod timer;

pub use alarm::*;
pub use program::*;
pub use realtime::*;
pub use sampler::*;
pub use scheduler::*;
pub use sim::{SimAlarm, SimClock};
pub use sink::*;
pub use timer::*;
