pub mod assets;
pub mod config;
pub mod device;
pub mod http;
pub mod logging;
pub mod persistence;
pub mod platform;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod telemetry;
pub mod upload;

pub use config::AppConfig;
pub use device::Device;
pub use service::Service;
