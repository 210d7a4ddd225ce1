//! Minimal legacy-PC peripheral drivers: the VGA text console, the PIT
//! tick source, and the RTC.

pub mod rtc;
pub mod timer;
pub mod video;
