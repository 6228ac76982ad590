pub mod controller;
pub mod idle_timer;
pub mod state;

pub use controller::{CaptureController, KeystrokeSink};
pub use idle_timer::{IdleTimer, TickControl};
pub use state::{CaptureStateMachine, CaptureStatus, FinishedCapture, KeyInput, Transition};
