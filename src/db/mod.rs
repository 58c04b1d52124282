mod connection;
mod driver;
mod params;
mod postgres;
mod query;

pub use connection::*;
pub use driver::*;
pub use params::*;
pub use postgres::*;
pub use query::*;
