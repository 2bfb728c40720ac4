//! Radio abstraction and drivers

pub mod traits;

#[cfg(feature = "embedded")]
pub mod esp_now;

#[cfg(test)]
pub use traits::mock;
pub use traits::{Delivery, DeliveryReport, LinkRadio, LinkReceiver, RadioError, RxFrame};
