//! Generic Access Profile: advertising the server to centrals

pub mod advertising;
pub mod constants;

pub use advertising::{
    AdvertiseMode, AdvertiseOptions, Advertiser, AdvertisingController, AdvertisingData,
    AdvertisingError, TxPowerLevel,
};
pub use constants::*;
