pub mod broadcast_publisher;
pub mod coalescing_source;
pub mod console_notifier;
pub mod event_bus;
pub mod fake_source;
pub mod memory_store;
pub mod multi_notifier;
pub mod platform_source;
pub mod sqlite_store;
pub mod telegram_notifier;
pub mod zenmarket_source;
