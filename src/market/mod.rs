//! Market session calendar and status computation

pub mod clock;

pub use clock::{compute_status, ClockReading, DaySchedule, HolidayRule, MarketCalendar, NextTransition};
