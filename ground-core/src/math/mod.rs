mod bounds;
pub use self::bounds::*;

mod region;
pub use self::region::*;
