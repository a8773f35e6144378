// tether-common: durable document shapes shared by the coordinator and its producers.

pub mod identity;
pub mod paths;
pub mod types;
