//! Static pump-family registry.
//!
//! Families are listed at compile time; the config names one by string
//! and [`build_driver`] constructs it.  Adding a family means adding a row
//! to [`FAMILIES`].

use std::sync::Arc;

use log::{error, info};

use super::{PumpDriver, VirtualPump};
use crate::app::ports::TimePort;
use crate::error::ConfigError;

/// One registered pump family.
pub struct PumpFamily {
    pub name: &'static str,
    pub build: fn(Arc<dyn TimePort>) -> Box<dyn PumpDriver>,
}

fn build_virtual(clock: Arc<dyn TimePort>) -> Box<dyn PumpDriver> {
    Box::new(VirtualPump::new(clock))
}

pub static FAMILIES: &[PumpFamily] = &[PumpFamily { name: "virtual", build: build_virtual }];

pub fn family(name: &str) -> Option<&'static PumpFamily> {
    FAMILIES.iter().find(|f| f.name == name)
}

/// Construct the driver registered under `name`.
pub fn build_driver(name: &str, clock: Arc<dyn TimePort>) -> Result<Box<dyn PumpDriver>, ConfigError> {
    let Some(family) = family(name) else {
        error!("pump registry: unknown family '{name}'");
        return Err(ConfigError::UnknownPumpFamily);
    };
    info!("pump registry: using '{}' driver", family.name);
    Ok((family.build)(clock))
}
