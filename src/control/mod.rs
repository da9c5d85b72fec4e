//! Interactive flight control
//!
//! An input capability answers "is this key active", a key map turns the
//! active keys into one action per cycle, and the control loop hands that
//! action to the session.

mod control_loop;
pub mod input;

pub use control_loop::{Action, ActionExecutor, ControlLoop, KeyMap, LoopExit};
pub use input::{InputSource, KeyLatch};
