//! Support library for the gateway server: frequency plan lookup, modulation
//! parameters, and time-on-air calculations. Kept separate from the binary
//! crate the way a `lorawan` support crate is kept separate from the gateway
//! binary, so it can be exercised and tested without pulling in any
//! transport code.

pub mod frequency_plan;
pub mod modulation;

pub use frequency_plan::{Channel, Direction, FrequencyPlan, FrequencyPlanStore, RxWindowParams, SubBand};
pub use modulation::{time_on_air, CodingRate, Modulation};
