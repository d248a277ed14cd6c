pub mod clock;

pub use clock::VirtualClock;
