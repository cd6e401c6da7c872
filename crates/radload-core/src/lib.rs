pub mod aggregate;
pub mod config;
pub mod exchange;
pub mod executor;
pub mod limiter;
pub mod pacer;
pub mod plan;
pub mod radius;
pub mod rate_limiter;
pub mod record;
pub mod sequencer;
pub mod sink;

pub use aggregate::*;
pub use config::*;
pub use exchange::*;
pub use executor::*;
pub use limiter::*;
pub use pacer::*;
pub use plan::*;
pub use radius::{ResponseCode, UdpExchanger};
pub use rate_limiter::*;
pub use record::*;
pub use sequencer::*;
pub use sink::*;
