// Re-export modules for library use
pub mod config;
pub mod mock_device;
