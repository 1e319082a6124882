// gpu-control library root

pub mod clk_arb;
pub mod config;
pub mod device;
pub mod error;
pub mod fifo;
pub mod worker;
