//! Time facilities: the HPET event queue and the blocking timer facade.

pub mod hpet;
pub mod timer;

pub use timer::Timer;
