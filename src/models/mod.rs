pub mod booking;
pub mod event;
pub mod seat;
pub mod ticket;

pub use booking::{Booking, BookingSeatRow};
pub use event::{Event, SeatType};
pub use seat::{Seat, SeatLock};
pub use ticket::{Ticket, TicketJob};
