pub mod cashcarry;
pub mod triangular;

pub use cashcarry::{CashCarryScanner, CashCarrySettings};
pub use triangular::{TriangularScanner, TriangularSettings};
