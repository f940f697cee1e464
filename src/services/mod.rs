pub mod bookings;
pub mod idempotency;
pub mod locks;
pub mod payment;
pub mod sweeper;
pub mod tickets;
