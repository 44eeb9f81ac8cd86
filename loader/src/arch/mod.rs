pub mod riscv64;

pub use riscv64::{enter, halt, hart_id, park, pmp};
