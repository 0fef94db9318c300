pub mod change;
pub mod display;
pub mod enums;
pub mod related;
pub mod tooth;

pub use change::*;
pub use display::*;
pub use enums::*;
pub use related::*;
pub use tooth::*;
