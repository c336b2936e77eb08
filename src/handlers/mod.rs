pub mod carts;
pub mod common;
pub mod orders;
pub mod payments;
pub mod products;
